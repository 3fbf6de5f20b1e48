use crate::model::{generate_id, GatewayResponse, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a federated query. States only ever advance in the
/// declaration order below; `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Started,
    InProgress,
    Finished,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Created => "created",
            QueryState::Started => "started",
            QueryState::InProgress => "in_progress",
            QueryState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Entry endpoint targeted by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Structures,
    References,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Structures => "structures",
            EndpointType::References => "references",
        }
    }
}

impl Default for EndpointType {
    fn default() -> Self {
        EndpointType::Structures
    }
}

/// OPTIMADE entry-listing query parameters, carried opaquely.
///
/// `filter` is forwarded verbatim to every upstream; the gateway never
/// parses the filter grammar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_fields: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
}

impl QueryParameters {
    /// URL-encode the set parameters, in a stable field order.
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(v) = &self.filter {
            pairs.push(("filter", v.clone()));
        }
        if let Some(v) = &self.response_format {
            pairs.push(("response_format", v.clone()));
        }
        if let Some(v) = &self.response_fields {
            pairs.push(("response_fields", v.clone()));
        }
        if let Some(v) = &self.email_address {
            pairs.push(("email_address", v.clone()));
        }
        if let Some(v) = &self.sort {
            pairs.push(("sort", v.clone()));
        }
        if let Some(v) = self.page_limit {
            pairs.push(("page_limit", v.to_string()));
        }
        if let Some(v) = self.page_offset {
            pairs.push(("page_offset", v.to_string()));
        }
        if let Some(v) = &self.include {
            pairs.push(("include", v.clone()));
        }
        for (key, value) in pairs {
            serializer.append_pair(key, &value);
        }
        serializer.finish()
    }

    pub fn is_empty(&self) -> bool {
        *self == QueryParameters::default()
    }
}

/// A long-lived record of one federated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: Id,
    pub gateway_id: Id,
    pub query_parameters: QueryParameters,
    pub endpoint: EndpointType,
    pub state: QueryState,
    pub response: Option<GatewayResponse>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Query {
    pub fn new(gateway_id: Id, query_parameters: QueryParameters, endpoint: EndpointType) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            gateway_id,
            query_parameters,
            endpoint,
            state: QueryState::Created,
            response: None,
            created_at: now,
            last_updated: now,
        }
    }
}

/// Body of `POST /gateways/{id}/queries`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewQuery {
    #[serde(default)]
    pub query_parameters: QueryParameters,
    #[serde(default)]
    pub endpoint: EndpointType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_order_matches_lifecycle() {
        assert!(QueryState::Created < QueryState::Started);
        assert!(QueryState::Started < QueryState::InProgress);
        assert!(QueryState::InProgress < QueryState::Finished);
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&QueryState::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn query_string_keeps_filter_verbatim() {
        let params = QueryParameters {
            filter: Some(r#"elements HAS "Si" AND nelements<3"#.to_string()),
            page_limit: Some(10),
            ..Default::default()
        };
        let encoded = params.to_query_string();
        assert!(encoded.starts_with("filter="));
        assert!(encoded.ends_with("&page_limit=10"));
        let decoded: Vec<(String, String)> = url::form_urlencoded::parse(encoded.as_bytes())
            .into_owned()
            .collect();
        assert_eq!(decoded[0].1, r#"elements HAS "Si" AND nelements<3"#);
    }

    #[test]
    fn empty_parameters_produce_empty_query_string() {
        assert_eq!(QueryParameters::default().to_query_string(), "");
        assert!(QueryParameters::default().is_empty());
    }

    #[test]
    fn new_query_starts_created_without_response() {
        let query = Query::new("gw".into(), QueryParameters::default(), EndpointType::Structures);
        assert_eq!(query.state, QueryState::Created);
        assert!(query.response.is_none());
    }
}
