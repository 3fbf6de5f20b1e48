use axum::serve;
use optimade_gateway::api::routes::create_router;
use optimade_gateway::api::AppState;
use optimade_gateway::config::AppConfig;
use optimade_gateway::store::PostgresStore;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info) // Default to Info for everything
        .filter_module("sqlx", LevelFilter::Warn) // Suppress sqlx Debug logs
        .init();

    // Load configuration
    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}:{}, {} max concurrent upstreams",
        config.server.host,
        config.server.port,
        config.gateway.max_concurrent_upstreams
    );

    log::info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let max_connections = config.database.max_connections.unwrap_or(20);
    let postgres_store = PostgresStore::new(&database_url, max_connections).await?;

    log::info!("Running database migrations...");
    postgres_store.migrate().await?;

    let state = AppState::new(Arc::new(postgres_store), config.clone());

    run_server(create_router().with_state(state), &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("OPTIMADE gateway serving on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}
