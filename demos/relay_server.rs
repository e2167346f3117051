//! Camera relay server example
//!
//! Run with: cargo run --example relay_server [CONFIG.toml]
//!
//! The config path may also come from `CAMRELAY_CONFIG`. Without one, both
//! listeners bind their default ports and a small in-memory camera roster is
//! used.
//!
//! ## Try it
//!
//! Ask for a stream on the internal listener:
//!   echo '{"request_type":"stream_request","camera_name":"cam1"}' | nc localhost 9500
//!
//! Collect the resulting signal as the camera agent on the external listener:
//!   echo '{"request_type":"signal","client_id":"agent-1"}' | nc localhost 9501
//!
//! ## Example config
//!
//! ```toml
//! internal_addr = "0.0.0.0:9500"
//! external_addr = "0.0.0.0:9501"
//!
//! [broker]
//! stream_source_timeout_ms = 10000
//! known_clients = ["agent-1"]
//!
//! [logging]
//! level = "camrelay=debug"
//! format = "json"
//! ```

use std::sync::Arc;

use camrelay::broker::MemoryDirectory;
use camrelay::server::{LogFormat, LoggingConfig, RelayConfig, RelayServer};

const CONFIG_ENV: &str = "CAMRELAY_CONFIG";

fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?
        .add_directive("relay_server=info".parse()?);

    match logging.format {
        LogFormat::Json => fmt().json().with_env_filter(filter).with_target(true).init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok());

    let config = match &path {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default().broker(
            camrelay::broker::BrokerConfig::default().known_client("agent-1"),
        ),
    };

    init_logging(&config.logging)?;

    let directory = Arc::new(MemoryDirectory::new());
    directory.add_camera("cam1", Some("agent-1".into())).await;
    directory.add_camera("cam2", Some("agent-1".into())).await;

    tracing::info!(
        config = path.as_deref().unwrap_or("<defaults>"),
        internal = %config.internal_addr,
        external = %config.external_addr,
        "Starting camera relay"
    );

    let server = RelayServer::new(config, directory);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;

    tracing::info!("Camera relay stopped");
    Ok(())
}
