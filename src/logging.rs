//! `tracing` subscriber setup. Human-readable by default; `KILN_LOG_JSON=1`
//! switches to structured JSON for shipping to log aggregators.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("KILN_LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
