use crate::model::{GatewayResponse, Id, Query, QueryState};
use crate::store::{DocumentStore, Filter, ListOptions, StoreError, QUERIES};
use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryLifecycleError {
    #[error("no query record with id {0:?}")]
    NotFound(Id),
    #[error("illegal query state transition {from} -> {to}")]
    InvalidTransition { from: QueryState, to: QueryState },
    #[error("`response` must be set exactly when a query finishes")]
    ResponseMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persist a freshly built query record (state `created`).
pub async fn create<S: DocumentStore>(
    store: &S,
    query: Query,
) -> Result<Query, QueryLifecycleError> {
    store.insert(QUERIES, to_document(&query)?).await?;
    Ok(query)
}

/// Advance a query record to `new_state`.
///
/// States only move forward in the `created < started < in_progress <
/// finished` order; a finished record is immutable. `response` must
/// accompany the transition to `finished` and no other.
pub async fn advance<S: DocumentStore>(
    store: &S,
    id: &str,
    new_state: QueryState,
    response: Option<GatewayResponse>,
) -> Result<Query, QueryLifecycleError> {
    let mut query = get(store, id).await?;
    if new_state <= query.state {
        return Err(QueryLifecycleError::InvalidTransition {
            from: query.state,
            to: new_state,
        });
    }
    if (new_state == QueryState::Finished) != response.is_some() {
        return Err(QueryLifecycleError::ResponseMismatch);
    }

    query.state = new_state;
    query.response = response;
    query.last_updated = Utc::now();

    let patch = json!({
        "state": query.state,
        "response": query.response,
        "last_updated": query.last_updated,
    });
    match store.update(QUERIES, id, patch).await {
        Ok(()) => Ok(query),
        Err(StoreError::NotFound) => Err(QueryLifecycleError::NotFound(id.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Load a query record. By the lifecycle invariant its `response` is
/// present exactly when the state is `finished`.
pub async fn get<S: DocumentStore>(store: &S, id: &str) -> Result<Query, QueryLifecycleError> {
    match store.get(QUERIES, id).await {
        Ok(doc) => from_document(doc),
        Err(StoreError::NotFound) => Err(QueryLifecycleError::NotFound(id.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Page through all query records, newest last.
pub async fn list<S: DocumentStore>(
    store: &S,
    skip: usize,
    limit: usize,
) -> Result<(Vec<Query>, u64), QueryLifecycleError> {
    let options = ListOptions {
        sort: Some("created_at".to_string()),
        skip,
        limit: Some(limit),
    };
    let (docs, total) = store.list(QUERIES, &Filter::new(), &options).await?;
    let queries = docs
        .into_iter()
        .map(from_document)
        .collect::<Result<Vec<Query>, _>>()?;
    Ok((queries, total))
}

fn to_document(query: &Query) -> Result<serde_json::Value, QueryLifecycleError> {
    Ok(serde_json::to_value(query)
        .context("failed to serialize query record")
        .map_err(StoreError::Backend)?)
}

fn from_document(doc: serde_json::Value) -> Result<Query, QueryLifecycleError> {
    Ok(serde_json::from_value(doc)
        .context("stored query record is malformed")
        .map_err(StoreError::Backend)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EndpointType, QueryMeta, QueryParameters, ResponseMeta, ToplevelLinks, API_VERSION,
    };
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn merged_response() -> GatewayResponse {
        GatewayResponse {
            data: vec![],
            errors: vec![],
            meta: ResponseMeta {
                query: QueryMeta {
                    representation: "/gateways/g/structures".into(),
                },
                api_version: API_VERSION.to_string(),
                data_returned: 0,
                data_available: 0,
                more_data_available: false,
                sources: BTreeMap::new(),
            },
            links: ToplevelLinks::default(),
        }
    }

    async fn created_query(store: &MemoryStore) -> Query {
        let query = Query::new(
            "gw".into(),
            QueryParameters::default(),
            EndpointType::Structures,
        );
        create(store, query).await.unwrap()
    }

    #[tokio::test]
    async fn lifecycle_advances_in_order() {
        let store = MemoryStore::new();
        let query = created_query(&store).await;

        advance(&store, &query.id, QueryState::Started, None).await.unwrap();
        advance(&store, &query.id, QueryState::InProgress, None).await.unwrap();
        let finished = advance(
            &store,
            &query.id,
            QueryState::Finished,
            Some(merged_response()),
        )
        .await
        .unwrap();

        assert_eq!(finished.state, QueryState::Finished);
        assert!(finished.response.is_some());

        let reread = get(&store, &query.id).await.unwrap();
        assert_eq!(reread, finished);
    }

    #[tokio::test]
    async fn backwards_transition_is_rejected() {
        let store = MemoryStore::new();
        let query = created_query(&store).await;
        advance(&store, &query.id, QueryState::InProgress, None).await.unwrap();

        let err = advance(&store, &query.id, QueryState::Started, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueryLifecycleError::InvalidTransition {
                from: QueryState::InProgress,
                to: QueryState::Started,
            }
        ));
    }

    #[tokio::test]
    async fn finished_records_are_immutable() {
        let store = MemoryStore::new();
        let query = created_query(&store).await;
        advance(
            &store,
            &query.id,
            QueryState::Finished,
            Some(merged_response()),
        )
        .await
        .unwrap();

        let before = get(&store, &query.id).await.unwrap();
        let err = advance(
            &store,
            &query.id,
            QueryState::Finished,
            Some(merged_response()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryLifecycleError::InvalidTransition { .. }));
        assert_eq!(get(&store, &query.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn response_is_tied_to_the_finishing_transition() {
        let store = MemoryStore::new();
        let query = created_query(&store).await;

        let err = advance(
            &store,
            &query.id,
            QueryState::Started,
            Some(merged_response()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueryLifecycleError::ResponseMismatch));

        let err = advance(&store, &query.id, QueryState::Finished, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryLifecycleError::ResponseMismatch));
    }

    #[tokio::test]
    async fn missing_record_is_reported_as_such() {
        let store = MemoryStore::new();
        let err = get(&store, "nope").await.unwrap_err();
        assert!(matches!(err, QueryLifecycleError::NotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn list_pages_by_creation_time() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            created_query(&store).await;
        }
        let (page, total) = list(&store, 1, 10).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
    }
}
