#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::net::SocketAddr;
use std::sync::Arc;

use server::config::ServerConfig;
use server::index::store::MemKv;
use server::index::tracker::Tracker;
use server::index::{IndexConfig, NodeRole, Range, VlsnIndex};
use server::replication::{FeederConfig, FeederManager, LogDirectory};
use server::types::Vlsn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: log_directory={}, listen_port={}",
        config.log_directory.display(),
        config.listen_port
    );

    // Create the log directory if this is a fresh node
    if let Err(e) = std::fs::create_dir_all(&config.log_directory) {
        tracing::error!("Failed to create log directory: {e}");
        std::process::exit(1);
    }

    let index_config = IndexConfig::default();
    let recovery = Tracker::new(index_config.bucket_policy(), Range::EMPTY, Vlsn::NULL);
    let index = match VlsnIndex::open(MemKv::new(), index_config, NodeRole::Master, recovery) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            tracing::error!("Failed to open VLSN index: {e}");
            std::process::exit(1);
        }
    };

    let feeder_config = FeederConfig {
        lease_duration: config.lease_duration,
        max_message_size: config.max_message_size,
        ..FeederConfig::default()
    };
    let manager = FeederManager::new(
        feeder_config,
        LogDirectory::new(config.log_directory),
        index,
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
    tracing::info!("feeder listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind: {e}");
            std::process::exit(1);
        });

    manager.serve(listener).await;
}
