use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

/// Install the global subscriber. Returns `false` if one was already set,
/// which happens when several simulations share a process.
pub fn init_tracing(filter: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = Registry::default().with(env_filter);
    let installed = match format {
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };
    installed.is_ok()
}
