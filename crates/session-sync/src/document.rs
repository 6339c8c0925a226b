use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StoreError;

pub type Fields = serde_json::Map<String, Value>;

/// A stored document. `version` increases by one on every committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub version: u64,
    pub fields: Fields,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        lookup(&self.fields, field)
    }

    /// Decode into an entity. The document id is injected as `"id"`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, StoreError> {
        let mut object = self.fields.clone();
        object.insert("id".into(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(object)).map_err(|source| StoreError::Decode {
            collection: self.collection.clone(),
            id: self.id.clone(),
            source,
        })
    }
}

/// Merge `patch` into `target`. Dotted keys (`recordingUrls.user-1`) address
/// nested objects, creating intermediate objects as needed.
pub fn apply_patch(target: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        if !key.contains('.') {
            target.insert(key, value);
            continue;
        }
        let mut segments: Vec<&str> = key.split('.').collect();
        let leaf = segments.pop().unwrap_or_default();
        let mut cursor = &mut *target;
        for segment in segments {
            let slot = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Fields::new()));
            if !slot.is_object() {
                *slot = Value::Object(Fields::new());
            }
            cursor = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot replaced with an object above"),
            };
        }
        cursor.insert(leaf.to_string(), value);
    }
}

fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = fields.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::NotEq => actual != &self.value,
            op => match compare_values(actual, &self.value) {
                Some(ordering) => match op {
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Le => ordering != Ordering::Greater,
                    FilterOp::Gt => ordering == Ordering::Greater,
                    FilterOp::Ge => ordering != Ordering::Less,
                    FilterOp::Eq | FilterOp::NotEq => unreachable!(),
                },
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Collection-scoped query with equality/range filters, ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Sort and truncate matched documents according to the query.
    pub fn finish(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if let Some(order) = &self.order_by {
            docs.sort_by(|a, b| {
                let ordering = match (a.get(&order.field), b.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        } else {
            docs.sort_by(|a, b| a.id.cmp(&b.id));
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
