//! Tracing subscriber initialization.
//!
//! Log verbosity is controlled with the standard `RUST_LOG` variable (default `info`). Output is
//! human readable unless `log_format: json` is configured, in which case every event is a single
//! JSON object per line, suitable for log shippers.
//!
//! Webhook delivery outcomes are emitted on the `audit` target, so they can be routed or filtered
//! separately, e.g. `RUST_LOG=info,audit=info`.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogFormat;

/// Initialize the global tracing subscriber.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
                .try_init()?;
        }
    }

    info!(?format, "Telemetry initialized");
    Ok(())
}
