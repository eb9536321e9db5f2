//! scribe sync server.
//!
//! Configured through `SCRIBE_*` environment variables; log level via `RUST_LOG`.

use log::{error, info};
use scribe_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting scribe server...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let server = match SyncServer::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot start server: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
