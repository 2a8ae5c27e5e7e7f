//! The unified request router: one JSON-RPC-over-stdio session exposing
//! exactly two tools — `find` and `run` — backed by the discovery engine and
//! the supervisor.
//!
//! The session accepts requests immediately; catalog indexing happens in the
//! background, so the upstream handshake never blocks on embedding work.
//! Requests are handled on spawned tasks and answered in completion order;
//! stdout is owned by a single writer task and carries nothing but protocol.

pub mod confirm;
mod format;

pub use confirm::{ConfirmOutcome, Confirmer, NoChannel};
pub use format::Depth;

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::discovery::{Candidate, DiscoveryEngine};
use crate::errors::{PatchbayError, PatchbayResult};
use crate::rpc::{self, Incoming, Request, Response, RpcError};
use crate::supervisor::Supervisor;

const DEFAULT_FIND_LIMIT: usize = 5;
const MAX_FIND_LIMIT: usize = 50;
const SUGGESTION_LIMIT: usize = 5;

#[derive(Debug, Deserialize)]
pub struct FindParams {
    pub description: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub depth: Option<Depth>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RunParams {
    tool: String,
    #[serde(default)]
    parameters: Value,
}

/// A failed `run`, with discovery suggestions when the tool id didn't
/// resolve.
#[derive(Debug)]
pub struct RunError {
    pub error: PatchbayError,
    pub suggestions: Vec<Candidate>,
}

impl From<PatchbayError> for RunError {
    fn from(error: PatchbayError) -> Self {
        Self {
            error,
            suggestions: Vec::new(),
        }
    }
}

impl RunError {
    fn to_rpc_error(&self) -> RpcError {
        let mut data = json!({"kind": self.error.kind()});
        if !self.suggestions.is_empty() {
            data["suggestions"] = Value::Array(
                self.suggestions
                    .iter()
                    .map(|c| {
                        json!({
                            "tool": c.tool_id,
                            "description": c.description,
                            "confidence": c.confidence,
                        })
                    })
                    .collect(),
            );
        }
        RpcError::with_data(self.error.rpc_code(), self.error.client_message(), data)
    }
}

pub struct Router {
    supervisor: Arc<Supervisor>,
    catalog: Arc<Catalog>,
    discovery: Arc<DiscoveryEngine>,
    confirmer: Arc<dyn Confirmer>,
}

impl Router {
    pub fn new(
        supervisor: Arc<Supervisor>,
        catalog: Arc<Catalog>,
        discovery: Arc<DiscoveryEngine>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        Self {
            supervisor,
            catalog,
            discovery,
            confirmer,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    /// Ranked, human-readable discovery over the catalog.
    pub async fn find(&self, params: FindParams) -> PatchbayResult<String> {
        let limit = params
            .limit
            .unwrap_or(DEFAULT_FIND_LIMIT)
            .clamp(1, MAX_FIND_LIMIT);
        let page = params.page.unwrap_or(1).max(1);
        let depth = params.depth.unwrap_or_default();

        // Fetch enough for the requested page in one ranking pass.
        let candidates = self
            .discovery
            .search(&params.description, limit * page, params.confidence_threshold)
            .await;
        Ok(format::render_results(
            &params.description,
            &candidates,
            &self.catalog.snapshot(),
            depth,
            page,
            limit,
        ))
    }

    /// Validate, apply the modification policy, and dispatch one tool call.
    pub async fn run(&self, tool_id: &str, parameters: Value) -> Result<Value, RunError> {
        let Some((server, tool_name)) = tool_id.split_once(':') else {
            return Err(PatchbayError::InvalidParams(format!(
                "'{}' is not a tool id; expected server:tool",
                tool_id
            ))
            .into());
        };
        if server.is_empty() || tool_name.is_empty() {
            return Err(PatchbayError::InvalidParams(format!(
                "'{}' is not a tool id; expected server:tool",
                tool_id
            ))
            .into());
        }

        let snapshot = self.catalog.snapshot();
        let Some(entry) = snapshot.get(tool_id) else {
            let suggestions = self
                .discovery
                .search(&tool_id.replace([':', '_', '-'], " "), SUGGESTION_LIMIT, Some(0.0))
                .await;
            return Err(RunError {
                error: PatchbayError::NotFound(format!("tool '{}'", tool_id)),
                suggestions,
            });
        };

        let settings = &self.supervisor.profile().settings;
        if confirm::is_modifying(
            &self.discovery,
            &entry.name,
            &entry.description,
            settings.confirm_threshold,
        )
        .await
        {
            match self.confirmer.confirm(tool_id, &entry.description).await {
                ConfirmOutcome::Approved => {}
                ConfirmOutcome::Denied => {
                    return Err(PatchbayError::UserCancelled.into());
                }
                ConfirmOutcome::Unavailable => {
                    if settings.confirm_fail_closed {
                        info!(
                            "denying modifying call to '{}': no confirmation channel and policy is fail-closed",
                            tool_id
                        );
                        return Err(PatchbayError::UserCancelled.into());
                    }
                }
            }
        }

        let timeout = Duration::from_secs(settings.call_timeout_secs);
        let result = self
            .supervisor
            .call(server, tool_name, parameters, timeout)
            .await?;
        Ok(result)
    }

    /// The two static tools every upstream client sees.
    fn upstream_tools() -> Value {
        json!([
            {
                "name": "find",
                "description": "Search every connected tool server with a natural-language description of what you want to do. Returns ranked tool ids for `run`.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "description": {"type": "string", "description": "What you want to accomplish"},
                        "limit": {"type": "integer", "description": "Results per page (default 5)"},
                        "page": {"type": "integer", "description": "Page number (default 1)"},
                        "depth": {"type": "string", "enum": ["names", "descriptions", "schemas"]},
                        "confidence_threshold": {"type": "number", "description": "Minimum confidence in [0,1]"}
                    },
                    "required": ["description"]
                }
            },
            {
                "name": "run",
                "description": "Invoke a tool by its `server:tool` id with the parameters its schema requires.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "tool": {"type": "string", "description": "Tool id, e.g. filesystem:read_file"},
                        "parameters": {"type": "object", "description": "Arguments for the tool"}
                    },
                    "required": ["tool"]
                }
            }
        ])
    }

    /// Handle one upstream request (never a notification).
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "initialize" => Response::success(
                id,
                json!({
                    "protocolVersion": rpc::PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "patchbay", "version": crate::VERSION},
                }),
            ),
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success(id, json!({"tools": Self::upstream_tools()})),
            "tools/call" => self.handle_tool_call(id, request.params.unwrap_or(json!({}))).await,
            other => Response::failure(id, RpcError::method_not_found(other)),
        }
    }

    async fn handle_tool_call(&self, id: Value, params: Value) -> Response {
        let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        match tool {
            "find" => match serde_json::from_value::<FindParams>(arguments) {
                Ok(find_params) => match self.find(find_params).await {
                    Ok(text) => Response::success(id, text_envelope(&text, false)),
                    Err(err) => Response::failure(
                        id,
                        RpcError::with_data(
                            err.rpc_code(),
                            err.client_message(),
                            json!({"kind": err.kind()}),
                        ),
                    ),
                },
                Err(e) => Response::failure(
                    id,
                    RpcError::new(rpc::INVALID_PARAMS, format!("invalid find parameters: {}", e)),
                ),
            },
            "run" => match serde_json::from_value::<RunParams>(arguments) {
                Ok(run_params) => match self.run(&run_params.tool, run_params.parameters).await {
                    // Downstream result envelopes pass through verbatim,
                    // including tool-level isError payloads.
                    Ok(result) => Response::success(id, result),
                    Err(run_err) => {
                        if matches!(run_err.error, PatchbayError::Internal(_)) {
                            warn!("run('{}') failed internally: {}", run_params.tool, run_err.error);
                        }
                        Response::failure(id, run_err.to_rpc_error())
                    }
                },
                Err(e) => Response::failure(
                    id,
                    RpcError::new(rpc::INVALID_PARAMS, format!("invalid run parameters: {}", e)),
                ),
            },
            other => Response::failure(
                id,
                RpcError::new(rpc::INVALID_PARAMS, format!("unknown tool '{}'", other)),
            ),
        }
    }

    /// Terminate one upstream session on stdin/stdout. Returns when the
    /// client closes its end.
    pub async fn serve_stdio(self: Arc<Self>) -> anyhow::Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            }
        });

        info!("upstream session open");
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match rpc::parse_line(&line) {
                Ok(Incoming::Request(request)) => {
                    if request.is_notification() {
                        debug!("upstream notification: {}", request.method);
                        continue;
                    }
                    let router = self.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = router.handle(request).await;
                        let _ = tx.send(rpc::to_line(&response));
                    });
                }
                Ok(Incoming::Response(_)) => {
                    debug!("ignoring response frame from upstream client");
                }
                Err(err) => {
                    let _ = tx.send(rpc::to_line(&Response::failure(Value::Null, err)));
                }
            }
        }
        info!("upstream session closed");
        drop(tx);
        let _ = writer.await;
        Ok(())
    }
}

/// MCP text payload envelope.
fn text_envelope(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Paths, Profile};
    use crate::test_support::{profile_with, scripted_server};
    use async_trait::async_trait;

    struct Fixture {
        router: Arc<Router>,
        _tmp: tempfile::TempDir,
    }

    struct FixedConfirmer(ConfirmOutcome);

    #[async_trait]
    impl Confirmer for FixedConfirmer {
        async fn confirm(&self, _tool_id: &str, _description: &str) -> ConfirmOutcome {
            self.0
        }
    }

    async fn fixture_with(profile: Profile, confirmer: Arc<dyn Confirmer>) -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::at(tmp.path().to_path_buf());
        paths.ensure_layout().unwrap();
        let profile = Arc::new(profile);
        let supervisor = Arc::new(Supervisor::new(profile.clone(), paths.clone()));
        let catalog = Arc::new(Catalog::new(profile.clone(), paths.clone()));
        catalog.rebuild(&supervisor, "test").await;
        let discovery = Arc::new(DiscoveryEngine::without_model(
            profile.settings.clone(),
            paths,
        ));
        discovery
            .index_catalog(&catalog.snapshot(), "test-hash")
            .await
            .unwrap();
        let router = Arc::new(Router::new(supervisor, catalog, discovery, confirmer));
        Fixture { router, _tmp: tmp }
    }

    async fn fixture() -> Fixture {
        fixture_with(
            profile_with(vec![("files", scripted_server())]),
            Arc::new(NoChannel),
        )
        .await
    }

    #[tokio::test]
    async fn tools_list_is_exactly_find_and_run() {
        let fx = fixture().await;
        let resp = fx
            .router
            .handle(Request::new(1, "tools/list", json!({})))
            .await;
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["find", "run"]);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let fx = fixture().await;
        let resp = fx
            .router
            .handle(Request::new(2, "resources/list", json!({})))
            .await;
        assert_eq!(resp.error.unwrap().code, rpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn find_renders_ranked_text() {
        let fx = fixture().await;
        let text = fx
            .router
            .find(FindParams {
                description: "read file".to_string(),
                limit: None,
                page: None,
                depth: None,
                confidence_threshold: None,
            })
            .await
            .unwrap();
        assert!(text.contains("files:read_file"));
    }

    #[tokio::test]
    async fn run_dispatches_to_downstream() {
        let fx = fixture().await;
        let result = fx
            .router
            .run("files:read_file", json!({"path": "/tmp/x"}))
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(false));
        fx.router.supervisor().stop_all().await;
    }

    #[tokio::test]
    async fn unknown_tool_returns_not_found_with_suggestions() {
        let fx = fixture().await;
        let err = fx
            .router
            .run("files:read_fil", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error.kind(), "NotFound");
        assert!(
            err.suggestions
                .iter()
                .any(|c| c.tool_id == "files:read_file"),
            "suggestions should include the near-miss"
        );

        let rpc_err = err.to_rpc_error();
        assert_eq!(rpc_err.data.unwrap()["kind"], json!("NotFound"));
    }

    #[tokio::test]
    async fn malformed_tool_id_is_invalid_params() {
        let fx = fixture().await;
        let err = fx.router.run("no-colon-here", json!({})).await.unwrap_err();
        assert_eq!(err.error.kind(), "InvalidParams");
    }

    #[tokio::test]
    async fn modifying_call_fail_closed_without_channel_is_cancelled() {
        let mut profile = profile_with(vec![("files", scripted_server())]);
        profile.settings.confirm_fail_closed = true;
        let fx = fixture_with(profile, Arc::new(NoChannel)).await;

        let err = fx
            .router
            .run("files:write_file", json!({"path": "/tmp/x", "content": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(err.error.kind(), "UserCancelled");
    }

    #[tokio::test]
    async fn modifying_call_fail_open_proceeds() {
        let fx = fixture().await;
        let result = fx
            .router
            .run("files:write_file", json!({"path": "/tmp/x", "content": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(false));
        fx.router.supervisor().stop_all().await;
    }

    #[tokio::test]
    async fn denied_confirmation_cancels() {
        let fx = fixture_with(
            profile_with(vec![("files", scripted_server())]),
            Arc::new(FixedConfirmer(ConfirmOutcome::Denied)),
        )
        .await;
        let err = fx
            .router
            .run("files:write_file", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error.kind(), "UserCancelled");
    }

    #[tokio::test]
    async fn tool_call_with_unknown_name_is_invalid_params() {
        let fx = fixture().await;
        let resp = fx
            .router
            .handle(Request::new(
                3,
                "tools/call",
                json!({"name": "inspect", "arguments": {}}),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn find_via_tools_call_returns_text_envelope() {
        let fx = fixture().await;
        let resp = fx
            .router
            .handle(Request::new(
                4,
                "tools/call",
                json!({"name": "find", "arguments": {"description": "write file"}}),
            ))
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(false));
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("files:write_file"));
    }
}
