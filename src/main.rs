use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notewire::clock::SystemClock;
use notewire::config::ServerConfig;
use notewire::hub::BroadcastHub;
use notewire::model::{Group, Note};
use notewire::{MutationService, RecordStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = ServerConfig::from_env();

    let store = match &cfg.db_path {
        Some(path) => RecordStore::open(path)?,
        None => RecordStore::open_in_memory()?,
    };
    store.create_table::<Note>()?;
    store.create_table::<Group>()?;

    let hub = BroadcastHub::new();
    let service = MutationService::new(store, hub, Arc::new(SystemClock));

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, "notewire listening");
    notewire::api::serve(service, listener).await?;
    Ok(())
}
