use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers::{self, AppState};
use crate::store::DocumentStore;

pub fn create_router<S: DocumentStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Static OPTIMADE metadata
        .route("/info", get(handlers::get_info::<S>))
        .route("/links", get(handlers::get_links::<S>))
        .route("/versions", get(handlers::get_versions))
        // Database registration
        .route("/databases", get(handlers::list_databases::<S>))
        .route("/databases", post(handlers::register_database::<S>))
        .route("/databases/:database_id", get(handlers::get_database::<S>))
        .route(
            "/databases/:database_id",
            put(handlers::reregister_database::<S>),
        )
        // Gateway management
        .route("/gateways", get(handlers::list_gateways::<S>))
        .route("/gateways", post(handlers::create_gateway::<S>))
        .route("/gateways/:gateway_id", get(handlers::get_gateway::<S>))
        // Federated structure listings
        .route(
            "/gateways/:gateway_id/structures",
            get(handlers::get_gateway_structures::<S>),
        )
        .route(
            "/gateways/:gateway_id/structures/*entry_ref",
            get(handlers::get_gateway_structure::<S>),
        )
        // Asynchronous queries
        .route(
            "/gateways/:gateway_id/queries",
            post(handlers::create_gateway_query::<S>),
        )
        .route(
            "/gateways/:gateway_id/queries",
            get(handlers::list_gateway_queries::<S>),
        )
        .route("/queries", get(handlers::list_queries::<S>))
        .route("/queries/:query_id", get(handlers::get_query::<S>))
        // One-shot search across databases
        .route("/search", get(handlers::search::<S>))
}
