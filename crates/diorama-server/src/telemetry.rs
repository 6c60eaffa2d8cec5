//! Tracing setup for the diorama server.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing output.
///
/// Respects `RUST_LOG`; without it, logs at info globally and debug for
/// the diorama crates.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,diorama_server=debug,diorama_gateway=debug,diorama_lifecycle=debug")
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Telemetry initialized");
    Ok(())
}

/// Initialize tracing with human-friendly multi-line output.
///
/// Selected by setting `DIORAMA_LOG_PRETTY`; meant for local development.
pub fn init_local() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("debug,diorama_server=trace,diorama_gateway=trace,diorama_lifecycle=trace")
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Telemetry initialized (local)");
    Ok(())
}

/// Emit the final shutdown notice. Fmt output is unbuffered, so there is
/// nothing to flush.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
