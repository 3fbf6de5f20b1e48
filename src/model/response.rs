use crate::model::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// OPTIMADE API version the gateway speaks.
pub const API_VERSION: &str = "1.1.0";

/// Version path prepended to upstream base URLs.
pub const VERSION_PATH: &str = "/v1";

/// Whether a source contributed data or an error to a merged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Ok,
    Error,
}

/// One per-source error folded into a merged response. Transport failures
/// are rendered with status 504.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceError {
    pub source: Id,
    pub status: u16,
    pub detail: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToplevelLinks {
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Literal query string as received by the gateway.
    pub representation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub query: QueryMeta,
    pub api_version: String,
    pub data_returned: u64,
    pub data_available: u64,
    pub more_data_available: bool,
    /// Per-source outcome, keyed by database id.
    pub sources: BTreeMap<Id, SourceStatus>,
}

/// The merged, protocol-compliant response for a federated listing.
///
/// `data` concatenates the upstream `data` arrays in the gateway's declared
/// database order; entry ids are rewritten to `"{database_id}/{id}"`. The
/// concatenation is never re-sorted across sources, so a `sort` parameter
/// only yields locally sorted segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub data: Vec<Value>,
    pub errors: Vec<SourceError>,
    pub meta: ResponseMeta,
    pub links: ToplevelLinks,
}

impl GatewayResponse {
    pub fn first_error_status(&self) -> Option<u16> {
        self.errors.iter().map(|e| e.status).find(|s| *s >= 300)
    }
}

/// Meta for single-entry fetches; `data_available` is intentionally absent,
/// it would require querying every database of the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleEntryMeta {
    pub query: QueryMeta,
    pub api_version: String,
    pub data_returned: u64,
    pub more_data_available: bool,
}

/// Response for `GET /gateways/{id}/structures/{entry_ref}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleEntryResponse {
    pub data: Option<Value>,
    pub errors: Vec<SourceError>,
    pub meta: SingleEntryMeta,
    pub links: ToplevelLinks,
}
