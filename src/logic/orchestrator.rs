use crate::client::{FetchOutcome, TransportErrorKind, UpstreamClient};
use crate::config::GatewayConfig;
use crate::logic::merge::{merge_response, SourceOutcome};
use crate::logic::queries::{self, QueryLifecycleError};
use crate::logic::registry::{self, RegistryError};
use crate::model::{Query, QueryState, VERSION_PATH};
use crate::store::DocumentStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lifecycle(#[from] QueryLifecycleError),
}

/// Runs federated queries to completion: fan-out, per-upstream timeout,
/// state transitions, result assembly.
///
/// `run` both serves the synchronous endpoints (caller awaits it) and the
/// asynchronous ones (`spawn_detached` anchors it to the runtime, so a
/// client disconnect never cancels it). In the synchronous case the caller
/// dropping the future drops the `JoinSet`, which aborts all in-flight
/// upstream requests.
pub struct Orchestrator<S> {
    store: Arc<S>,
    client: UpstreamClient,
    config: GatewayConfig,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: DocumentStore + 'static> Orchestrator<S> {
    pub fn new(store: Arc<S>, client: UpstreamClient, config: GatewayConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Run a query record (state `created`) to `finished`.
    ///
    /// Per-upstream failures never abort the run; they surface inside the
    /// merged response. Store failures do abort it, leaving the record in
    /// its last successfully persisted state.
    pub async fn run(&self, query: Query) -> Result<Query, OrchestrateError> {
        let gateway = registry::load_gateway(&*self.store, &query.gateway_id).await?;
        let query = queries::advance(&*self.store, &query.id, QueryState::Started, None).await?;

        let params = query.query_parameters.to_query_string();
        let count = gateway.databases.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_upstreams.max(1)));
        let mut join_set = JoinSet::new();

        // Task start order is the gateway's declared database order; the
        // semaphore queue is FIFO, so excess tasks wait in that order too.
        for (index, database) in gateway.databases.iter().enumerate() {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let base_url = database.base_url.clone();
            let endpoint = query.endpoint.as_str().to_string();
            let params = params.clone();
            let per_db_timeout = self.config.per_db_timeout();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            FetchOutcome::TransportError {
                                kind: TransportErrorKind::Read,
                                message: "fan-out semaphore closed".to_string(),
                            },
                        )
                    }
                };
                let outcome = client
                    .fetch(&base_url, VERSION_PATH, &endpoint, &params, per_db_timeout)
                    .await;
                (index, outcome)
            });
        }

        let query =
            queries::advance(&*self.store, &query.id, QueryState::InProgress, None).await?;

        let mut outcomes: Vec<Option<FetchOutcome>> = (0..count).map(|_| None).collect();
        let deadline = tokio::time::sleep(self.config.gateway_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok((index, outcome))) => outcomes[index] = Some(outcome),
                    Some(Err(e)) => log::error!("upstream fan-out task failed: {e}"),
                },
            }
        }
        // Whatever is still running has missed the overall deadline.
        join_set.abort_all();

        let tagged = gateway
            .databases
            .iter()
            .zip(outcomes)
            .map(|(database, outcome)| SourceOutcome {
                database_id: database.id.clone(),
                outcome: outcome.unwrap_or_else(|| FetchOutcome::TransportError {
                    kind: TransportErrorKind::Timeout,
                    message: format!(
                        "timeout: gateway deadline of {}ms elapsed",
                        self.config.gateway_timeout().as_millis()
                    ),
                }),
            })
            .collect();

        let representation = listing_representation(&query);
        let merged = merge_response(
            &query.query_parameters,
            &representation,
            &self.config.base_url,
            tagged,
        );
        let query = queries::advance(
            &*self.store,
            &query.id,
            QueryState::Finished,
            Some(merged),
        )
        .await?;
        Ok(query)
    }

    /// Run a query in the background, anchored to the runtime rather than to
    /// any HTTP request.
    pub fn spawn_detached(&self, query: Query) {
        let orchestrator = self.clone();
        let query_id = query.id.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(query).await {
                log::error!("federated query {query_id} aborted: {e}");
            }
        });
    }
}

/// The gateway-local path (plus query string) a query stands for.
pub fn listing_representation(query: &Query) -> String {
    let query_string = query.query_parameters.to_query_string();
    if query_string.is_empty() {
        format!("/gateways/{}/{}", query.gateway_id, query.endpoint.as_str())
    } else {
        format!(
            "/gateways/{}/{}?{query_string}",
            query.gateway_id,
            query.endpoint.as_str()
        )
    }
}
