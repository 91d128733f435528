use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webhook_relay::config::{Config, QueueKind, StoreKind};
use webhook_relay::server::Relay;
use webhook_relay::{JobQueue, MemoryQueue, MemoryStore, RelayError};
use webhook_relay::EventStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.monitoring.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = %config.ingest.platform,
        "starting webhook-relay"
    );

    let store = build_store(&config).await?;
    let queue = build_queue(&config)?;

    let relay = Relay::new(&config, store, queue).await?;
    relay.run().await?;
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn EventStore>, RelayError> {
    match config.store.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "postgres")]
        StoreKind::Postgres => {
            let connection_string = config.store.connection_string.as_deref().ok_or_else(|| {
                RelayError::Config("store.connection_string is required for postgres".to_string())
            })?;
            let store = webhook_relay::PostgresStore::connect(connection_string).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreKind::Postgres => Err(RelayError::Config(
            "built without the `postgres` feature".to_string(),
        )),
    }
}

fn build_queue(config: &Config) -> Result<Arc<dyn JobQueue>, RelayError> {
    match config.queue.kind {
        QueueKind::Memory => Ok(Arc::new(MemoryQueue::new(
            config.queue.visibility_timeout(),
            config.queue.max_attempts,
        ))),
        #[cfg(feature = "redis")]
        QueueKind::Redis => {
            let url = config.queue.url.as_deref().ok_or_else(|| {
                RelayError::Config("queue.url is required for redis".to_string())
            })?;
            let queue = webhook_relay::RedisQueue::new(
                url,
                config.queue.visibility_timeout(),
                config.queue.max_attempts,
            )?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        QueueKind::Redis => Err(RelayError::Config(
            "built without the `redis` feature".to_string(),
        )),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},tower_http=debug")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
