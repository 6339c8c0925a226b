use serde_json::Value;
use session_sync::SessionSyncClient;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Transactionally add `delta` to an integer field of an existing document,
/// clamping at zero. Unlike [`SessionSyncClient::increment`] this never
/// recreates a deleted document.
pub(crate) async fn adjust(
    sync: &SessionSyncClient,
    collection: &str,
    entity: &'static str,
    id: &str,
    field: &str,
    delta: i64,
) -> CoordinatorResult<i64> {
    let doc = sync
        .transact(collection, id, |current| {
            let doc = current.ok_or_else(|| CoordinatorError::NotFound {
                entity,
                id: id.to_string(),
            })?;
            let mut fields = doc.fields.clone();
            let value = fields.get(field).and_then(Value::as_i64).unwrap_or(0);
            fields.insert(field.to_string(), Value::from((value + delta).max(0)));
            Ok::<_, CoordinatorError>(fields)
        })
        .await?;
    Ok(doc.get(field).and_then(Value::as_i64).unwrap_or(0))
}
