use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global `tracing` subscriber configured from `RUST_LOG`,
/// defaulting to `info`. Fails if a subscriber is already set.
pub fn init_logging() -> Result<(), crate::RuntimeError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .try_init()?;

    Ok(())
}
