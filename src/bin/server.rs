use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rusty_jukebox::config::ServerConfig;
use rusty_jukebox::constants::ROOM_SWEEP_INTERVAL_SECS;
use rusty_jukebox::core::{Coordinator, MessageHandler};
use rusty_jukebox::handlers::routes;
use rusty_jukebox::pipeline::{
    ActionQueue, EventRelay, EventSink, MutationWorker, SqliteActionQueue, SqliteEventLog,
};
use rusty_jukebox::storage::{
    self, CachedLookup, MetadataLookup, OEmbedLookup, QueueStorage, SqliteQueueStorage,
};

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, node={}",
        config.host, config.port, config.pipeline.node_id
    );

    if let Err(e) = run(config).await {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> rusty_jukebox::Result<()> {
    let pool = storage::connect(&config.database_url).await?;

    let sqlite_storage = SqliteQueueStorage::new(pool.clone());
    sqlite_storage.migrate().await?;
    let action_queue = SqliteActionQueue::new(pool.clone(), config.pipeline.lease);
    action_queue.migrate().await?;
    let event_log = Arc::new(SqliteEventLog::new(pool));
    event_log.migrate().await?;

    let queue_storage: Arc<dyn QueueStorage> = Arc::new(sqlite_storage);
    let action_queue: Arc<dyn ActionQueue> = Arc::new(action_queue);
    let lookup: Arc<dyn MetadataLookup> = Arc::new(CachedLookup::new(Arc::new(
        OEmbedLookup::new(config.oembed_endpoint.clone())?,
    )));

    let coordinator = Arc::new(Coordinator::from_config(
        &config,
        Arc::clone(&queue_storage),
        Arc::clone(&action_queue),
    ));

    let pending = action_queue.pending_count().await?;
    if pending > 0 {
        info!("Resuming {} pending actions", pending);
    }

    let worker = Arc::new(MutationWorker::new(
        queue_storage,
        lookup,
        action_queue,
        Arc::clone(&event_log) as Arc<dyn EventSink>,
        config.pipeline.clone(),
        coordinator.wake_handle(),
    ));
    worker.spawn();

    Arc::new(
        EventRelay::new(
            event_log,
            Arc::clone(&coordinator),
            config.pipeline.poll_interval,
        )
        .await?,
    )
    .spawn();

    Arc::clone(&coordinator).start_cleanup_task(
        Duration::from_secs(ROOM_SWEEP_INTERVAL_SECS),
        config.policy.room_grace,
    );

    let handler = Arc::new(MessageHandler::new(coordinator));
    let routes = routes(handler, &config);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            rusty_jukebox::JukeboxError::ConfigError(format!("Invalid server address: {}", e))
        })?;

    match (config.enable_tls, &config.tls_cert_path, &config.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            info!("Starting Rusty Jukebox server on wss://{}", addr);
            warp::serve(routes)
                .tls()
                .cert_path(cert_path)
                .key_path(key_path)
                .run(addr)
                .await;
        }
        _ => {
            info!("Starting Rusty Jukebox server on ws://{}", addr);
            warp::serve(routes).run(addr).await;
        }
    }
    Ok(())
}
