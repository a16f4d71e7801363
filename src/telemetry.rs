use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use crate::config::LogFormat;

/// Initialize tracing
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap_or_default();

    // Decide on layers
    let reg = Registry::default().with(env_filter);
    match format {
        LogFormat::Compact => reg.with(tracing_subscriber::fmt::layer().compact()).init(),
        LogFormat::Json => reg.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
