use eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber printing compact log lines, filtered by
/// `RUST_LOG` (default `info`).
///
/// Fails if a global subscriber is already installed.
pub fn initialize_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init()?;

    Ok(())
}
