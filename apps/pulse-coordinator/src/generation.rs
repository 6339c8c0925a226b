use std::sync::Arc;
use std::time::{Duration, Instant};

use service_sdk::{GenerationKind, GenerationRequest, TextGenerator};
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics;

fn kind_label(kind: GenerationKind) -> &'static str {
    match kind {
        GenerationKind::WorkoutPlan => "workout_plan",
        GenerationKind::Quiz => "quiz",
    }
}

/// One generation attempt, bounded by `timeout` when set. Records the
/// attempt's latency and result.
pub(crate) async fn generate_once(
    generator: &Arc<dyn TextGenerator>,
    request: &GenerationRequest,
    timeout: Option<Duration>,
) -> CoordinatorResult<String> {
    let kind = kind_label(request.kind);
    let started = Instant::now();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, generator.generate(request)).await {
            Ok(reply) => reply.map_err(CoordinatorError::from),
            Err(_) => Err(CoordinatorError::GenerationTimeout),
        },
        None => generator.generate(request).await.map_err(CoordinatorError::from),
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    metrics::GENERATION_LATENCY_MS
        .with_label_values(&[kind])
        .observe(elapsed_ms);
    let outcome = match &result {
        Ok(_) => "ok",
        Err(CoordinatorError::GenerationTimeout) => "timeout",
        Err(_) => "error",
    };
    metrics::GENERATION_REQUESTS
        .with_label_values(&[kind, outcome])
        .inc();
    debug!(target = "generation", kind, outcome, elapsed_ms, "generation attempt finished");
    result
}
