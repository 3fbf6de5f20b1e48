use crate::client::FetchOutcome;
use crate::model::{
    GatewayResponse, Id, QueryMeta, QueryParameters, ResponseMeta, SingleEntryMeta,
    SingleEntryResponse, SourceError, SourceStatus, ToplevelLinks, API_VERSION,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use url::Url;

/// OPTIMADE default page size, used when the caller set no `page_limit`.
pub const DEFAULT_PAGE_LIMIT: u64 = 20;

/// One upstream outcome tagged with the database it came from.
#[derive(Debug)]
pub struct SourceOutcome {
    pub database_id: Id,
    pub outcome: FetchOutcome,
}

/// Merge N tagged outcomes into one protocol response.
///
/// `outcomes` must arrive in the gateway's declared database order; the
/// merged `data` concatenates in that order and is never re-sorted across
/// sources. Every entry id is namespaced as `"{database_id}/{id}"`. Since
/// `page_limit` was forwarded to every upstream, the merged page holds up to
/// `N * page_limit` entries.
pub fn merge_response(
    params: &QueryParameters,
    representation: &str,
    gateway_base_url: &str,
    outcomes: Vec<SourceOutcome>,
) -> GatewayResponse {
    let mut data = Vec::new();
    let mut errors = Vec::new();
    let mut sources = BTreeMap::new();
    let mut data_returned: u64 = 0;
    let mut data_available: u64 = 0;
    let mut more_data_available = false;

    for SourceOutcome {
        database_id,
        outcome,
    } in outcomes
    {
        match outcome {
            FetchOutcome::Success(body) => match body.get("data").and_then(Value::as_array) {
                Some(entries) => {
                    let meta = body.get("meta");
                    data_returned +=
                        meta_count(meta, "data_returned").unwrap_or(entries.len() as u64);
                    data_available +=
                        meta_count(meta, "data_available").unwrap_or(entries.len() as u64);
                    more_data_available |= meta_flag(meta, "more_data_available");
                    for entry in entries {
                        let mut entry = entry.clone();
                        prefix_entry_id(&mut entry, &database_id);
                        data.push(entry);
                    }
                    sources.insert(database_id, SourceStatus::Ok);
                }
                None => {
                    // A 2xx body carrying `errors` instead of `data`.
                    let (status, detail) = reported_error(&body);
                    errors.push(SourceError {
                        source: database_id.clone(),
                        status,
                        detail,
                        kind: "upstream".to_string(),
                    });
                    sources.insert(database_id, SourceStatus::Error);
                }
            },
            FetchOutcome::UpstreamError { status, body } => {
                let (_, detail) = reported_error(&body);
                errors.push(SourceError {
                    source: database_id.clone(),
                    status,
                    detail,
                    kind: "upstream".to_string(),
                });
                sources.insert(database_id, SourceStatus::Error);
            }
            FetchOutcome::TransportError { kind, message } => {
                errors.push(SourceError {
                    source: database_id.clone(),
                    status: 504,
                    detail: format!("{kind}: {message}"),
                    kind: "transport".to_string(),
                });
                sources.insert(database_id, SourceStatus::Error);
            }
        }
    }

    let next = if more_data_available {
        next_link(gateway_base_url, representation, params)
    } else {
        None
    };

    GatewayResponse {
        data,
        errors,
        meta: ResponseMeta {
            query: QueryMeta {
                representation: representation.to_string(),
            },
            api_version: API_VERSION.to_string(),
            data_returned,
            data_available,
            more_data_available,
            sources,
        },
        links: ToplevelLinks { next },
    }
}

/// Render one upstream outcome as a single-entry response, namespacing the
/// returned id back into gateway form.
pub fn merge_single_entry(
    database_id: &str,
    outcome: FetchOutcome,
    representation: &str,
) -> SingleEntryResponse {
    let mut data = None;
    let mut errors = Vec::new();
    let mut data_returned = 0;
    let mut more_data_available = false;

    match outcome {
        FetchOutcome::Success(body) => match body.get("data") {
            Some(entry) if !entry.is_null() => {
                let mut entry = entry.clone();
                prefix_entry_id(&mut entry, database_id);
                let meta = body.get("meta");
                data_returned = meta_count(meta, "data_returned").unwrap_or(1);
                more_data_available = meta_flag(meta, "more_data_available");
                data = Some(entry);
            }
            Some(_null) => {}
            None => {
                let (status, detail) = reported_error(&body);
                errors.push(SourceError {
                    source: database_id.to_string(),
                    status,
                    detail,
                    kind: "upstream".to_string(),
                });
            }
        },
        FetchOutcome::UpstreamError { status, body } => {
            let (_, detail) = reported_error(&body);
            errors.push(SourceError {
                source: database_id.to_string(),
                status,
                detail,
                kind: "upstream".to_string(),
            });
        }
        FetchOutcome::TransportError { kind, message } => {
            errors.push(SourceError {
                source: database_id.to_string(),
                status: 504,
                detail: format!("{kind}: {message}"),
                kind: "transport".to_string(),
            });
        }
    }

    SingleEntryResponse {
        data,
        errors,
        meta: SingleEntryMeta {
            query: QueryMeta {
                representation: representation.to_string(),
            },
            api_version: API_VERSION.to_string(),
            data_returned,
            more_data_available,
        },
        links: ToplevelLinks::default(),
    }
}

/// Rewrite an entry's `id` to `"{database_id}/{id}"`. Everything else in the
/// entry is left untouched.
fn prefix_entry_id(entry: &mut Value, database_id: &str) {
    if let Some(object) = entry.as_object_mut() {
        if let Some(id) = object.get("id") {
            let original = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            object.insert("id".to_string(), json!(format!("{database_id}/{original}")));
        }
    }
}

fn meta_count(meta: Option<&Value>, field: &str) -> Option<u64> {
    meta?.get(field)?.as_u64()
}

fn meta_flag(meta: Option<&Value>, field: &str) -> bool {
    meta.and_then(|m| m.get(field))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Status and detail out of an OPTIMADE error body's first error object.
fn reported_error(body: &Value) -> (u16, String) {
    let first = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first());

    let status = first
        .and_then(|e| e.get("status"))
        .and_then(|status| match status {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.split_whitespace().find_map(|part| part.parse().ok()),
            _ => None,
        })
        .unwrap_or(500) as u16;

    let detail = first
        .and_then(|e| e.get("detail"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            let mut raw = body.to_string();
            raw.truncate(200);
            format!("upstream reported an error response: {raw}")
        });

    (status, detail)
}

/// Re-emit the caller's URL with `page_offset` advanced by `page_limit`.
fn next_link(
    gateway_base_url: &str,
    representation: &str,
    params: &QueryParameters,
) -> Option<String> {
    let full = format!("{}{representation}", gateway_base_url.trim_end_matches('/'));
    let mut url = Url::parse(&full).ok()?;

    let offset = params.page_offset.unwrap_or(0);
    let limit = params.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT);

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "page_offset")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in &pairs {
            query.append_pair(key, value);
        }
        query.append_pair("page_offset", &(offset + limit).to_string());
    }
    Some(url.to_string())
}
