//! Tracing subscriber initialization, mirroring the teacher's
//! `logging::init(format)` entry point: one call, made once, at process
//! start or at the top of a test harness.

use crate::config::LogFormat;
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

pub fn init(format: LogFormat) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        match format {
            LogFormat::Plain => {
                let _ = subscriber.try_init();
            }
            LogFormat::Json => {
                let _ = subscriber.json().try_init();
            }
        }
    });
}

/// Test-only helper: idempotent, cheap to call at the top of every test.
#[cfg(test)]
pub fn init_for_tests() {
    init(LogFormat::Plain);
}
