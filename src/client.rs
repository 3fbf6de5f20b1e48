use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Why a request never produced a usable upstream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Dns,
    Connect,
    Tls,
    Read,
    Decode,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Read => "read",
            TransportErrorKind::Decode => "decode",
        };
        f.write_str(name)
    }
}

/// Outcome of one upstream OPTIMADE request.
///
/// `Success` requires a 2xx status and a JSON body carrying a top-level
/// `data` or `errors` member; a non-2xx with a decodable JSON body keeps
/// that body in `UpstreamError`; everything else is a transport error.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Value),
    UpstreamError { status: u16, body: Value },
    TransportError { kind: TransportErrorKind, message: String },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        FetchOutcome::TransportError {
            kind,
            message: message.into(),
        }
    }
}

/// HTTP client for upstream OPTIMADE databases.
///
/// The timeout is hard: when it fires the in-flight request is dropped and
/// the outcome is `TransportError { kind: Timeout }`. The client never
/// retries; there is no retry policy anywhere above it either.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Issue `GET {base_url}{version_path}/{endpoint}?{params}`.
    pub async fn fetch(
        &self,
        base_url: &str,
        version_path: &str,
        endpoint: &str,
        params: &str,
        timeout: Duration,
    ) -> FetchOutcome {
        let mut url = format!(
            "{}{}/{}",
            base_url.trim_end_matches('/'),
            version_path,
            endpoint.trim_matches('/')
        );
        if !params.is_empty() {
            url.push('?');
            url.push_str(params);
        }

        let response = match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport_error(&e),
        };

        let json: Value = match serde_json::from_str(&body) {
            Ok(json) => json,
            Err(_) => {
                return FetchOutcome::transport(
                    TransportErrorKind::Decode,
                    format!("response from {url} is not valid JSON"),
                )
            }
        };

        if (200..300).contains(&status) {
            if json.get("data").is_some() || json.get("errors").is_some() {
                FetchOutcome::Success(json)
            } else {
                FetchOutcome::transport(
                    TransportErrorKind::Decode,
                    format!("response from {url} has neither `data` nor `errors`"),
                )
            }
        } else {
            FetchOutcome::UpstreamError { status, body: json }
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_transport_error(error: &reqwest::Error) -> FetchOutcome {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_decode() {
        TransportErrorKind::Decode
    } else {
        // reqwest does not expose DNS/TLS failures directly; look at the
        // error chain.
        let mut chain = String::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(current) = source {
            chain.push_str(&current.to_string().to_lowercase());
            chain.push(' ');
            source = current.source();
        }
        if chain.contains("dns") {
            TransportErrorKind::Dns
        } else if chain.contains("tls") || chain.contains("certificate") || chain.contains("ssl") {
            TransportErrorKind::Tls
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Read
        }
    };
    FetchOutcome::transport(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn_upstream(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn fetch_returns_success_for_data_body() {
        let base_url = spawn_upstream(Router::new().route(
            "/v1/structures",
            get(|| async {
                axum::Json(json!({"data": [{"id": "a", "type": "structures"}], "meta": {}}))
            }),
        ))
        .await;

        let outcome = UpstreamClient::new()
            .fetch(&base_url, "/v1", "structures", "page_limit=1", timeout())
            .await;
        match outcome {
            FetchOutcome::Success(body) => assert_eq!(body["data"][0]["id"], "a"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_preserves_json_of_upstream_errors() {
        let base_url = spawn_upstream(Router::new().route(
            "/v1/structures",
            get(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({"errors": [{"detail": "boom"}]})),
                )
            }),
        ))
        .await;

        let outcome = UpstreamClient::new()
            .fetch(&base_url, "/v1", "structures", "", timeout())
            .await;
        match outcome {
            FetchOutcome::UpstreamError { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body["errors"][0]["detail"], "boom");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_flags_non_json_bodies_as_decode_errors() {
        let base_url = spawn_upstream(
            Router::new().route("/v1/structures", get(|| async { "<html>oops</html>" })),
        )
        .await;

        let outcome = UpstreamClient::new()
            .fetch(&base_url, "/v1", "structures", "", timeout())
            .await;
        match outcome {
            FetchOutcome::TransportError { kind, .. } => {
                assert_eq!(kind, TransportErrorKind::Decode)
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_flags_json_without_data_or_errors_as_decode() {
        let base_url = spawn_upstream(Router::new().route(
            "/v1/structures",
            get(|| async { axum::Json(json!({"meta": {}})) }),
        ))
        .await;

        let outcome = UpstreamClient::new()
            .fetch(&base_url, "/v1", "structures", "", timeout())
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::TransportError {
                kind: TransportErrorKind::Decode,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fetch_times_out_hard() {
        let base_url = spawn_upstream(Router::new().route(
            "/v1/structures",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                axum::Json(json!({"data": []}))
            }),
        ))
        .await;

        let outcome = UpstreamClient::new()
            .fetch(
                &base_url,
                "/v1",
                "structures",
                "",
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::TransportError {
                kind: TransportErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fetch_reports_connect_failures() {
        // Bind then drop the listener so the port is closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = UpstreamClient::new()
            .fetch(
                &format!("http://{addr}"),
                "/v1",
                "structures",
                "",
                timeout(),
            )
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::TransportError {
                kind: TransportErrorKind::Connect,
                ..
            }
        ));
    }
}
