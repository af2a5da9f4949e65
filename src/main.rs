//! Switchboard gateway entry point.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use switchboard::config::AppConfig;
use switchboard::{server, telemetry};

#[tokio::main]
async fn main() {
    telemetry::init();

    let config = match AppConfig::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server::start_server(config).await {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}
