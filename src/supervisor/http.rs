//! JSON-RPC transport for remote servers: HTTP POST with an optional
//! server-sent-events response stream.
//!
//! A 401 with `WWW-Authenticate` surfaces the advertised scheme so the
//! credentials collaborator can run its flow; the supervisor itself only
//! attaches whatever token the auth spec resolves.

use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::AuthSpec;
use crate::errors::{PatchbayError, PatchbayResult};
use crate::rpc::{self, Request, Response};

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpTransport {
    server: String,
    client: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(server: &str, url: &str, auth: Option<&AuthSpec>) -> Self {
        let auth_header = auth.and_then(|spec| {
            spec.resolve_token().map(|token| match spec.scheme.as_str() {
                "basic" => format!("Basic {}", token),
                _ => format!("Bearer {}", token),
            })
        });
        Self {
            server: server.to_string(),
            client: reqwest::Client::new(),
            url: url.to_string(),
            auth_header,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> PatchbayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, method, params);
        match tokio::time::timeout(timeout, self.round_trip(&request, id)).await {
            Ok(result) => result,
            Err(_) => Err(PatchbayError::Timeout(timeout.as_millis() as u64)),
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> PatchbayResult<()> {
        let note = Request::notification(method, params);
        let response = self
            .builder()
            .json(&note)
            .send()
            .await
            .map_err(|e| PatchbayError::TransportFailure(format!("POST {}: {}", self.url, e)))?;
        // Notifications are fire-and-forget; servers answer 200 or 202.
        if !response.status().is_success() {
            debug!(
                "notification '{}' to '{}' returned {}",
                method,
                self.server,
                response.status()
            );
        }
        Ok(())
    }

    fn builder(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream");
        if let Some(header) = &self.auth_header {
            builder = builder.header(reqwest::header::AUTHORIZATION, header.clone());
        }
        if let Some(session) = self.session_id.lock().expect("session lock").clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    async fn round_trip(&self, request: &Request, id: u64) -> PatchbayResult<Value> {
        let response = self
            .builder()
            .json(request)
            .send()
            .await
            .map_err(|e| PatchbayError::TransportFailure(format!("POST {}: {}", self.url, e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let scheme = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(detect_auth_scheme)
                .unwrap_or("unknown");
            return Err(PatchbayError::Unauthorised(format!(
                "server '{}' requires {} authentication",
                self.server, scheme
            )));
        }
        if !response.status().is_success() {
            return Err(PatchbayError::TransportFailure(format!(
                "server '{}' returned HTTP {}",
                self.server,
                response.status()
            )));
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session lock") = Some(session.to_string());
        }

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| PatchbayError::TransportFailure(format!("reading body: {}", e)))?;

        let rpc_response = if is_sse {
            find_response_in_sse(&body, id).ok_or_else(|| {
                PatchbayError::TransportFailure(format!(
                    "event stream from '{}' ended without a response for id {}",
                    self.server, id
                ))
            })?
        } else {
            serde_json::from_str::<Response>(&body).map_err(|e| {
                PatchbayError::TransportFailure(format!("invalid response body: {}", e))
            })?
        };

        match rpc_response.error {
            Some(err) => Err(PatchbayError::Downstream {
                code: err.code,
                message: err.message,
            }),
            None => Ok(rpc_response.result.unwrap_or(Value::Null)),
        }
    }
}

/// Classify a `WWW-Authenticate` header into the scheme the credentials
/// collaborator understands.
fn detect_auth_scheme(header: &str) -> &'static str {
    let lower = header.to_ascii_lowercase();
    if lower.contains("oauth") || lower.contains("authorization_uri") {
        "oauth"
    } else if lower.starts_with("basic") {
        "basic"
    } else if lower.starts_with("bearer") {
        "bearer"
    } else {
        "unknown"
    }
}

/// Parse an SSE body (events separated by blank lines, payloads on `data:`
/// lines) and pick out the JSON-RPC response matching `id`.
fn find_response_in_sse(body: &str, id: u64) -> Option<Response> {
    let mut current_data = String::new();
    let mut check = |data: &str| -> Option<Response> {
        let value: Value = serde_json::from_str(data.trim()).ok()?;
        if value.get("id").and_then(Value::as_u64) == Some(id) {
            serde_json::from_value::<Response>(value).ok()
        } else {
            None
        }
    };

    for line in body.lines() {
        if line.is_empty() {
            if !current_data.is_empty() {
                if let Some(resp) = check(&current_data) {
                    return Some(resp);
                }
                current_data.clear();
            }
        } else if let Some(data) = line.strip_prefix("data: ") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data);
        }
    }
    if !current_data.is_empty() {
        return check(&current_data);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_body_yields_matching_response() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"tools\":[]}}\n\n";
        let resp = find_response_in_sse(body, 7).unwrap();
        assert_eq!(resp.result, Some(json!({"tools": []})));
    }

    #[test]
    fn sse_skips_notifications_and_other_ids() {
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":1}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":2}\n\n",
        );
        let resp = find_response_in_sse(body, 4).unwrap();
        assert_eq!(resp.result, Some(json!(2)));
    }

    #[test]
    fn sse_without_matching_id_is_none() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":null}\n\n";
        assert!(find_response_in_sse(body, 2).is_none());
    }

    #[test]
    fn sse_final_event_without_trailing_blank_line() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":9,\"result\":\"late\"}";
        let resp = find_response_in_sse(body, 9).unwrap();
        assert_eq!(resp.result, Some(json!("late")));
    }

    #[test]
    fn auth_scheme_detection() {
        assert_eq!(detect_auth_scheme("Bearer realm=\"mcp\""), "bearer");
        assert_eq!(detect_auth_scheme("Basic realm=\"mcp\""), "basic");
        assert_eq!(
            detect_auth_scheme("Bearer authorization_uri=\"https://auth.example.com\", OAuth"),
            "oauth"
        );
        assert_eq!(detect_auth_scheme("Negotiate"), "unknown");
    }

    #[tokio::test]
    async fn http_request_roundtrip_against_mock() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"serverInfo": {"name": "remote", "version": "1.0"}}
            })))
            .mount(&mock)
            .await;

        let transport = HttpTransport::new("remote", &format!("{}/mcp", mock.uri()), None);
        let result = transport
            .request("initialize", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["serverInfo"]["name"], "remote");
    }

    #[tokio::test]
    async fn http_401_surfaces_auth_scheme() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer realm=\"mcp\""),
            )
            .mount(&mock)
            .await;

        let transport = HttpTransport::new("locked", &mock.uri(), None);
        let err = transport
            .request("initialize", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            PatchbayError::Unauthorised(msg) => assert!(msg.contains("bearer")),
            other => panic!("expected Unauthorised, got {:?}", other),
        }
    }
}
