use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RUST_LOG";

/// Install the process-wide subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Events go to stderr so command output on stdout stays clean.
pub fn init_logging() {
    let filter = std::env::var(LOG_ENV)
        .map(|env| {
            EnvFilter::from_str(&env)
                .unwrap_or_else(|err| panic!("invalid `{}` environment variable {}", LOG_ENV, err))
        })
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Subscriber for tests; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .with_test_writer()
        .try_init();
}
