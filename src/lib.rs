pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

// Export logic types
pub use logic::{
    BatchCompletionError, Executability, PipelineError, PipelineResult, VersionLocker,
    VersionStaging, WorkflowCompletion,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

/// Connect, migrate, start the lock sweep and serve until shutdown.
pub async fn run_server(config: &crate::config::AppConfig) -> anyhow::Result<()> {
    use axum::serve;
    use log::info;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    let database_url = config.database_url()?;
    let postgres_store =
        crate::store::PostgresStore::new(&database_url, config.max_connections()).await?;

    info!("Running database migrations...");
    postgres_store.migrate().await?;

    let store = Arc::new(postgres_store);

    let sweeper = match config.lock_sweep_interval() {
        Some(period) => {
            info!("Version lock sweep every {}s", period.as_secs());
            Some(crate::logic::VersionLocker::spawn(store.clone(), period))
        }
        None => {
            info!("Version lock sweep disabled");
            None
        }
    };

    // Create router with state
    let app: axum::Router = crate::api::routes::create_router().with_state(store);

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("SQL version server running on http://{}", bind_address);

    let served = serve(listener, app).await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    served?;

    Ok(())
}
