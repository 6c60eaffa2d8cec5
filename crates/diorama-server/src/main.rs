use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use diorama_gateway::{GatewayServer, GatewayServerConfig};
use diorama_lifecycle::wait_for_signal;

mod config;
mod session;
mod telemetry;

use config::ServerConfig;
use session::EchoSession;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("DIORAMA_LOG_PRETTY").is_ok() {
        telemetry::init_local()?;
    } else {
        telemetry::init()?;
    }

    info!("Diorama Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    config.log_config();

    let server = GatewayServer::start(
        GatewayServerConfig {
            bind_addr: config.bind_addr,
        },
        Arc::new(EchoSession::new()),
    )
    .await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(?signal, "Termination signal received");
        shutdown.request_shutdown();
    });

    server.run().await?;

    telemetry::shutdown();
    Ok(())
}
