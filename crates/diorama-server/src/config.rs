//! Server configuration from environment variables.
//!
//! # Environment Variables
//!
//! - `DIORAMA_BIND_ADDR`: address the gateway listens on
//!   (default: `0.0.0.0:8765`)

use std::net::SocketAddr;

use tracing::{info, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the gateway listens on
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".parse().unwrap(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let default = Self::default();

        let bind_addr = match std::env::var("DIORAMA_BIND_ADDR") {
            Ok(raw) => match raw.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(value = %raw, "Invalid DIORAMA_BIND_ADDR, using default");
                    default.bind_addr
                }
            },
            Err(_) => default.bind_addr,
        };

        Self { bind_addr }
    }

    /// Log the active configuration.
    pub fn log_config(&self) {
        info!("Listening on: {}", self.bind_addr);
    }
}
