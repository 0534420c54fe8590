use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use pos_sync_core::api::{app_router, AppState, ServerConfig};
use pos_sync_core::db_migration;
use pos_sync_core::domains::sync::handler::HandlerRegistry;
use pos_sync_core::domains::sync::repository::{
    SqliteSyncQueueRepository, SqliteSyncRecordRepository,
};
use pos_sync_core::domains::sync::service::SyncServiceImpl;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = ServerConfig::from_env()?;
    log::info!("starting sync server on {}", config.bind_addr);

    let connect_options: SqliteConnectOptions = config.database_url.parse()?;
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options.create_if_missing(true))
        .await?;

    db_migration::run_migrations(&pool).await?;

    let records = Arc::new(SqliteSyncRecordRepository::new(pool.clone()));
    let queue = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
    let handlers = Arc::new(HandlerRegistry::with_defaults());
    let service = SyncServiceImpl::new(pool, records, queue, handlers)
        .with_limits(config.max_batch_size, config.retry_ceiling);

    let state = AppState::new(Arc::new(service));
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("sync server listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
