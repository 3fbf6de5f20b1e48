use axum::{
    extract::{Path, Query as UrlQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::api::error::{
    self, bad_request, filter_not_supported, internal, not_found, ApiResult,
};
use crate::client::UpstreamClient;
use crate::config::AppConfig;
use crate::logic::orchestrator::Orchestrator;
use crate::logic::{merge, queries, registry};
use crate::model::{
    Database, DatabaseRef, EndpointType, Gateway, GatewayResponse, NewDatabase, NewGateway,
    NewQuery, Query, QueryParameters, QueryState, SingleEntryResponse, API_VERSION, VERSION_PATH,
};
use crate::store::{DocumentStore, Filter, ListOptions, StoreError, DATABASES, GATEWAYS, QUERIES};

/// Shared state behind every handler: the document store, the upstream
/// client, the fan-out orchestrator bound to both, and the loaded
/// configuration.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub client: UpstreamClient,
    pub orchestrator: Orchestrator<S>,
    pub config: AppConfig,
}

impl<S: DocumentStore + 'static> AppState<S> {
    pub fn new(store: Arc<S>, config: AppConfig) -> Arc<Self> {
        let client = UpstreamClient::new();
        let orchestrator =
            Orchestrator::new(store.clone(), client.clone(), config.gateway.clone());
        Arc::new(Self {
            store,
            client,
            orchestrator,
            config,
        })
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Pagination (and the unsupported `filter`) for gateway-local listings.
#[derive(Debug, Deserialize)]
pub struct ListingParams {
    pub filter: Option<String>,
    pub page_limit: Option<usize>,
    pub page_offset: Option<usize>,
}

const LISTING_PAGE_LIMIT: usize = 20;

#[derive(Debug, Serialize)]
pub struct CollectionMeta {
    pub data_returned: u64,
    pub data_available: u64,
    pub more_data_available: bool,
}

#[derive(Debug, Serialize)]
pub struct CollectionResponse<T> {
    pub data: Vec<T>,
    pub meta: CollectionMeta,
}

#[derive(Debug, Serialize)]
pub struct SingleMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SingleResponse<T> {
    pub data: T,
    pub meta: SingleMeta,
}

impl<T> SingleResponse<T> {
    fn new(data: T) -> Self {
        Self {
            data,
            meta: SingleMeta { created: None },
        }
    }

    fn created(data: T, created: bool) -> Self {
        Self {
            data,
            meta: SingleMeta {
                created: Some(created),
            },
        }
    }
}

fn decode_documents<T: DeserializeOwned>(docs: Vec<Value>) -> ApiResult<Vec<T>> {
    docs.into_iter()
        .map(|doc| serde_json::from_value(doc).map_err(internal))
        .collect()
}

async fn list_collection<S: DocumentStore, T: DeserializeOwned>(
    store: &S,
    collection: &str,
    filter: Filter,
    params: &ListingParams,
) -> ApiResult<CollectionResponse<T>> {
    if params.filter.as_deref().is_some_and(|f| !f.is_empty()) {
        return Err(filter_not_supported());
    }
    let limit = params.page_limit.unwrap_or(LISTING_PAGE_LIMIT);
    let skip = params.page_offset.unwrap_or(0);
    let options = ListOptions {
        sort: Some("created_at".to_string()),
        skip,
        limit: Some(limit),
    };
    let (docs, total) = store
        .list(collection, &filter, &options)
        .await
        .map_err(error::from_store)?;
    let returned = docs.len() as u64;
    Ok(CollectionResponse {
        data: decode_documents(docs)?,
        meta: CollectionMeta {
            data_returned: returned,
            data_available: total,
            more_data_available: (skip as u64 + returned) < total,
        },
    })
}

// ---------------------------------------------------------------------------
// Gateways

pub async fn list_gateways<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    UrlQuery(params): UrlQuery<ListingParams>,
) -> ApiResult<Json<CollectionResponse<Gateway>>> {
    let response = list_collection(&*state.store, GATEWAYS, Filter::new(), &params).await?;
    Ok(Json(response))
}

/// `POST /gateways`: resolve-or-create. 201 when a record was inserted, 200
/// when an existing interned gateway matched the membership set.
pub async fn create_gateway<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(new_gateway): Json<NewGateway>,
) -> ApiResult<Response> {
    if new_gateway.databases.is_empty() {
        return Err(bad_request("a gateway needs at least one database"));
    }
    for db_ref in &new_gateway.databases {
        if let DatabaseRef::Descriptor(descriptor) = db_ref {
            descriptor.validate().map_err(bad_request)?;
        }
    }

    let databases = registry::resolve_databases(&*state.store, &new_gateway.databases)
        .await
        .map_err(error::from_registry)?;
    let (gateway, created) = registry::resolve_or_create(&*state.store, databases, new_gateway.id)
        .await
        .map_err(error::from_registry)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(SingleResponse::created(gateway, created))).into_response())
}

pub async fn get_gateway<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(gateway_id): Path<String>,
) -> ApiResult<Json<SingleResponse<Gateway>>> {
    let gateway = registry::load_gateway(&*state.store, &gateway_id)
        .await
        .map_err(error::from_registry)?;
    Ok(Json(SingleResponse::new(gateway)))
}

// ---------------------------------------------------------------------------
// Federated structure listings

/// `GET /gateways/{id}/structures`: the synchronous federated listing. The
/// full fan-out runs within this request; dropping the connection drops the
/// orchestrator future and with it every in-flight upstream request.
pub async fn get_gateway_structures<S: DocumentStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(gateway_id): Path<String>,
    UrlQuery(params): UrlQuery<QueryParameters>,
) -> ApiResult<Json<GatewayResponse>> {
    run_sync(&state, gateway_id, params, EndpointType::Structures).await
}

async fn run_sync<S: DocumentStore + 'static>(
    state: &AppState<S>,
    gateway_id: String,
    params: QueryParameters,
    endpoint: EndpointType,
) -> ApiResult<Json<GatewayResponse>> {
    // Fail on unknown gateways before persisting anything.
    registry::load_gateway(&*state.store, &gateway_id)
        .await
        .map_err(error::from_registry)?;

    let query = Query::new(gateway_id, params, endpoint);
    let query = queries::create(&*state.store, query)
        .await
        .map_err(error::from_lifecycle)?;
    let finished = state
        .orchestrator
        .run(query)
        .await
        .map_err(error::from_orchestrate)?;

    match finished.response {
        Some(response) => Ok(Json(response)),
        None => Err(internal("finished query carries no response")),
    }
}

/// `GET /gateways/{id}/structures/{entry_ref}` where `entry_ref` is the
/// namespaced `{database_id}/{local_id}`.
pub async fn get_gateway_structure<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path((gateway_id, entry_ref)): Path<(String, String)>,
    UrlQuery(params): UrlQuery<QueryParameters>,
) -> ApiResult<Response> {
    let gateway = registry::load_gateway(&*state.store, &gateway_id)
        .await
        .map_err(error::from_registry)?;

    let Some(database) = gateway
        .databases
        .iter()
        .find(|db| entry_ref.starts_with(&format!("{}/", db.id)))
    else {
        return Err(not_found(format!(
            "structures entry <id={entry_ref:?}> not found; prefix the id with one of the \
             gateway's database ids followed by a slash. Available databases: {:?}",
            gateway.database_ids
        )));
    };
    let local_id = &entry_ref[database.id.len() + 1..];

    let query_string = params.to_query_string();
    let outcome = state
        .client
        .fetch(
            &database.base_url,
            VERSION_PATH,
            &format!("structures/{local_id}"),
            &query_string,
            state.config.gateway.per_db_timeout(),
        )
        .await;

    let representation = if query_string.is_empty() {
        format!("/gateways/{gateway_id}/structures/{entry_ref}")
    } else {
        format!("/gateways/{gateway_id}/structures/{entry_ref}?{query_string}")
    };
    let response: SingleEntryResponse =
        merge::merge_single_entry(&database.id, outcome, &representation);

    let status = response
        .errors
        .first()
        .map(|e| StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .unwrap_or(StatusCode::OK);
    Ok((status, Json(response)).into_response())
}

// ---------------------------------------------------------------------------
// Queries

/// `POST /gateways/{id}/queries`: create the record, detach the
/// orchestrator, reply 202. The background task outlives this request.
pub async fn create_gateway_query<S: DocumentStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(gateway_id): Path<String>,
    Json(new_query): Json<NewQuery>,
) -> ApiResult<Response> {
    registry::load_gateway(&*state.store, &gateway_id)
        .await
        .map_err(error::from_registry)?;

    let query = Query::new(gateway_id, new_query.query_parameters, new_query.endpoint);
    let query = queries::create(&*state.store, query)
        .await
        .map_err(error::from_lifecycle)?;
    state.orchestrator.spawn_detached(query.clone());

    Ok((StatusCode::ACCEPTED, Json(SingleResponse::new(query))).into_response())
}

pub async fn list_gateway_queries<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(gateway_id): Path<String>,
    UrlQuery(params): UrlQuery<ListingParams>,
) -> ApiResult<Json<CollectionResponse<Query>>> {
    let filter = Filter::new().eq("gateway_id", json!(gateway_id));
    let response = list_collection(&*state.store, QUERIES, filter, &params).await?;
    Ok(Json(response))
}

pub async fn list_queries<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    UrlQuery(params): UrlQuery<ListingParams>,
) -> ApiResult<Json<CollectionResponse<Query>>> {
    let response = list_collection(&*state.store, QUERIES, Filter::new(), &params).await?;
    Ok(Json(response))
}

/// `GET /queries/{id}`. The body always holds the record; the HTTP status
/// reflects the merged outcome once finished (first source error status
/// >= 300, or 500 when errored sources reported none).
pub async fn get_query<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(query_id): Path<String>,
) -> ApiResult<Response> {
    let query = queries::get(&*state.store, &query_id)
        .await
        .map_err(error::from_lifecycle)?;
    let status = query_http_status(&query);
    Ok((status, Json(SingleResponse::new(query))).into_response())
}

fn query_http_status(query: &Query) -> StatusCode {
    if query.state != QueryState::Finished {
        return StatusCode::OK;
    }
    match &query.response {
        Some(response) if !response.errors.is_empty() => {
            StatusCode::from_u16(response.first_error_status().unwrap_or(500))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::OK,
    }
}

// ---------------------------------------------------------------------------
// Search

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// Comma-separated ids of registered databases.
    pub database_ids: Option<String>,
    /// Comma-separated OPTIMADE base URLs to query without registration.
    pub optimade_urls: Option<String>,
    #[serde(default)]
    pub endpoint: EndpointType,
    /// Seconds to wait for the query to finish before replying 202.
    pub timeout: Option<u64>,
}

const SEARCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SEARCH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /search`: resolve-or-create a gateway for the requested databases,
/// create + detach a query, then poll for up to `timeout` seconds.
/// Replies 200 with the finished record, or 202 with the in-flight one.
pub async fn search<S: DocumentStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    UrlQuery(search_params): UrlQuery<SearchParams>,
    UrlQuery(params): UrlQuery<QueryParameters>,
) -> ApiResult<Response> {
    let mut refs: Vec<DatabaseRef> = Vec::new();
    if let Some(ids) = &search_params.database_ids {
        refs.extend(
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| DatabaseRef::Registered { id: id.to_string() }),
        );
    }
    if let Some(urls) = &search_params.optimade_urls {
        for base_url in urls.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            let descriptor = database_from_url(base_url)?;
            refs.push(DatabaseRef::Descriptor(descriptor));
        }
    }
    if refs.is_empty() {
        return Err(bad_request(
            "no databases to search: pass `database_ids` and/or `optimade_urls`",
        ));
    }

    let databases = registry::resolve_databases(&*state.store, &refs)
        .await
        .map_err(error::from_registry)?;
    let (gateway, created) = registry::resolve_or_create(&*state.store, databases, None)
        .await
        .map_err(error::from_registry)?;
    if created {
        log::debug!("a new gateway was created for a search (id={:?})", gateway.id);
    } else {
        log::debug!("a gateway was reused for a search (id={:?})", gateway.id);
    }

    let query = Query::new(gateway.id, params, search_params.endpoint);
    let query = queries::create(&*state.store, query)
        .await
        .map_err(error::from_lifecycle)?;
    state.orchestrator.spawn_detached(query.clone());

    let deadline = search_params
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(SEARCH_DEFAULT_TIMEOUT);
    let started = tokio::time::Instant::now();
    // Poll at least once, also with timeout=0.
    loop {
        let current = queries::get(&*state.store, &query.id)
            .await
            .map_err(error::from_lifecycle)?;
        if current.state == QueryState::Finished {
            let status = query_http_status(&current);
            return Ok((status, Json(SingleResponse::new(current))).into_response());
        }
        if started.elapsed() >= deadline {
            return Ok((StatusCode::ACCEPTED, Json(SingleResponse::new(current))).into_response());
        }
        tokio::time::sleep(SEARCH_POLL_INTERVAL).await;
    }
}

/// Derive an unregistered database descriptor from a bare base URL, slugging
/// the id the way the host/path reads (dots become double underscores).
fn database_from_url(base_url: &str) -> ApiResult<NewDatabase> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| bad_request(format!("invalid OPTIMADE URL {base_url:?}: {e}")))?;
    let mut authority = parsed.host_str().unwrap_or_default().to_string();
    if let Some(port) = parsed.port() {
        authority.push_str(&format!(":{port}"));
    }
    let name = format!("{authority}{}", parsed.path().trim_end_matches('/'));
    let id = name.replace('.', "__").replace(['/', ':'], "_");
    let descriptor = NewDatabase {
        id,
        name,
        base_url: base_url.trim_end_matches('/').to_string(),
        api_version: API_VERSION.to_string(),
        description: None,
        homepage: None,
        provider: None,
    };
    descriptor.validate().map_err(bad_request)?;
    Ok(descriptor)
}

// ---------------------------------------------------------------------------
// Databases

pub async fn list_databases<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    UrlQuery(params): UrlQuery<ListingParams>,
) -> ApiResult<Json<CollectionResponse<Database>>> {
    let response = list_collection(&*state.store, DATABASES, Filter::new(), &params).await?;
    Ok(Json(response))
}

pub async fn register_database<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(new_database): Json<NewDatabase>,
) -> ApiResult<Response> {
    new_database.validate().map_err(bad_request)?;
    let database = new_database.into_database();
    match state
        .store
        .insert(DATABASES, serde_json::to_value(&database).map_err(internal)?)
        .await
    {
        Ok(()) => Ok((
            StatusCode::CREATED,
            Json(SingleResponse::created(database, true)),
        )
            .into_response()),
        Err(StoreError::IdConflict) => Err(error::conflict(
            "Database Exists",
            format!(
                "a database with id {:?} is already registered; use PUT to re-register",
                database.id
            ),
        )),
        Err(e) => Err(error::from_store(e)),
    }
}

/// `PUT /databases/{id}`: explicit re-registration, the only way a
/// registered descriptor changes.
pub async fn reregister_database<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(database_id): Path<String>,
    Json(new_database): Json<NewDatabase>,
) -> ApiResult<Json<SingleResponse<Database>>> {
    if new_database.id != database_id {
        return Err(bad_request(format!(
            "body id {:?} does not match path id {database_id:?}",
            new_database.id
        )));
    }
    new_database.validate().map_err(bad_request)?;

    let existing = get_database_record(&*state.store, &database_id).await?;
    let mut database = new_database.into_database();
    database.created_at = existing.created_at;

    state
        .store
        .update(
            DATABASES,
            &database_id,
            serde_json::to_value(&database).map_err(internal)?,
        )
        .await
        .map_err(error::from_store)?;
    Ok(Json(SingleResponse::new(database)))
}

pub async fn get_database<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(database_id): Path<String>,
) -> ApiResult<Json<SingleResponse<Database>>> {
    let database = get_database_record(&*state.store, &database_id).await?;
    Ok(Json(SingleResponse::new(database)))
}

async fn get_database_record<S: DocumentStore>(store: &S, id: &str) -> ApiResult<Database> {
    match store.get(DATABASES, id).await {
        Ok(doc) => serde_json::from_value(doc).map_err(internal),
        Err(StoreError::NotFound) => {
            Err(not_found(format!("no database registered under id {id:?}")))
        }
        Err(e) => Err(error::from_store(e)),
    }
}

// ---------------------------------------------------------------------------
// Static OPTIMADE metadata

pub async fn get_info<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<Value> {
    let base_url = state.config.gateway.base_url.trim_end_matches('/');
    Json(json!({
        "data": {
            "id": "/",
            "type": "info",
            "attributes": {
                "api_version": API_VERSION,
                "available_api_versions": [
                    {"url": format!("{base_url}{VERSION_PATH}"), "version": API_VERSION}
                ],
                "formats": ["json"],
                "entry_types_by_format": {"json": ["structures", "references"]},
                "available_endpoints": [
                    "databases", "gateways", "info", "links", "queries", "search",
                    "structures", "versions"
                ],
                "is_index": false,
            },
        },
        "meta": {
            "api_version": API_VERSION,
            "more_data_available": false,
        },
    }))
}

/// `GET /links`: one `links` child per registered database.
pub async fn get_links<S: DocumentStore>(
    State(state): State<Arc<AppState<S>>>,
) -> ApiResult<Json<Value>> {
    let (docs, total) = state
        .store
        .list(DATABASES, &Filter::new(), &ListOptions::default())
        .await
        .map_err(error::from_store)?;
    let databases: Vec<Database> = decode_documents(docs)?;
    let links: Vec<Value> = databases
        .into_iter()
        .map(|db| {
            json!({
                "id": db.id,
                "type": "links",
                "attributes": {
                    "name": db.name,
                    "description": db.description,
                    "base_url": db.base_url,
                    "homepage": db.homepage,
                    "link_type": "child",
                },
            })
        })
        .collect();
    Ok(Json(json!({
        "data": links,
        "meta": {
            "api_version": API_VERSION,
            "data_returned": total,
            "data_available": total,
            "more_data_available": false,
        },
    })))
}

pub async fn get_versions() -> Response {
    let major = API_VERSION.split('.').next().unwrap_or("1");
    (
        [(header::CONTENT_TYPE, "text/csv; header=present")],
        format!("version\n{major}\n"),
    )
        .into_response()
}
