pub mod api;
pub mod client;
pub mod config;
pub mod logic;
pub mod model;
pub mod store;

pub use api::*;
pub use client::*;
pub use logic::*;
pub use model::*;
pub use store::*;

// Function for integration testing
pub async fn run_server() -> anyhow::Result<()> {
    use axum::serve;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging
    env_logger::init();

    // Load configuration
    let config = crate::config::AppConfig::load()?;

    // Connect to PostgreSQL
    let database_url = config.database_url()?;
    let max_connections = config.database.max_connections.unwrap_or(20);
    let postgres_store = crate::store::PostgresStore::new(&database_url, max_connections).await?;

    // Run migrations
    postgres_store.migrate().await?;

    let state = crate::api::AppState::new(Arc::new(postgres_store), config.clone());

    // Create router with state
    let app = crate::api::routes::create_router().with_state(state);

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;

    serve(listener, app).await?;

    Ok(())
}
