//! Framed JSON-RPC transport over a child process's stdio.
//!
//! One writer task serialises outbound lines onto the child's stdin; one
//! reader task demultiplexes responses by id into per-call oneshot channels.
//! Requests carry monotonic ids from an `AtomicU64`, so concurrent calls to
//! the same server multiplex safely over the single pipe pair. Stderr is
//! captured to the per-server log sink and a bounded in-memory ring for the
//! configuration heuristics — it is never interpreted as protocol.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::{PatchbayError, PatchbayResult};
use crate::rpc::{self, Incoming, Request, RpcError};
use crate::utils::logsink::LogSink;

const STDERR_RING_LINES: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Environment variables passed through from the parent process. The
/// config's `env` map is layered on top; everything else is scrubbed so
/// unrelated tokens never leak into child servers.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TZ", "TERM", "TMPDIR", "XDG_RUNTIME_DIR",
];

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

pub struct StdioTransport {
    server: String,
    child: tokio::sync::Mutex<Option<Child>>,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the configured command and wire up the framing tasks. The
    /// protocol handshake is the caller's job.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        stderr_log: LogSink,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.env_clear();
        for &var in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(var) {
                cmd.env(var, val);
            }
        }
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}' for server '{}'", command, server))?;

        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let stderr = child.stderr.take().context("child stderr unavailable")?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_LINES)));

        // Writer: the single owner of stdin. Dropping the channel closes the
        // child's stdin, which is the graceful-termination signal.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Reader: demultiplex responses by id. EOF fails every pending call.
        {
            let pending = pending.clone();
            let closed = closed.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match rpc::parse_line(&line) {
                        Ok(Incoming::Response(resp)) => {
                            let Some(id) = resp.id.as_u64() else {
                                debug!("non-numeric response id from '{}'", server);
                                continue;
                            };
                            let sender = pending.lock().expect("pending map lock").remove(&id);
                            match sender {
                                Some(sender) => {
                                    let outcome = match resp.error {
                                        Some(err) => Err(err),
                                        None => Ok(resp.result.unwrap_or(Value::Null)),
                                    };
                                    let _ = sender.send(outcome);
                                }
                                None => debug!("orphan response id {} from '{}'", id, server),
                            }
                        }
                        Ok(Incoming::Request(req)) => {
                            // Server-initiated requests (sampling, roots, …) are
                            // out of contract for an aggregated server.
                            debug!("ignoring server-initiated '{}' from '{}'", req.method, server);
                        }
                        Err(err) => {
                            debug!("unparseable frame from '{}': {}", server, err.message);
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                let mut map = pending.lock().expect("pending map lock");
                for (_, sender) in map.drain() {
                    let _ = sender.send(Err(RpcError::new(
                        rpc::INTERNAL_ERROR,
                        "connection closed",
                    )));
                }
            });
        }

        // Stderr: log sink + bounded ring, never protocol.
        {
            let ring = stderr_ring.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                let mut sink = stderr_log;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{} stderr] {}", server, line);
                    if let Err(e) = sink.append(&line) {
                        warn!("stderr sink for '{}' failed: {}", server, e);
                    }
                    let mut ring = ring.lock().expect("stderr ring lock");
                    if ring.len() >= STDERR_RING_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(line);
                }
            });
        }

        Ok(Self {
            server: server.to_string(),
            child: tokio::sync::Mutex::new(Some(child)),
            tx: Mutex::new(Some(tx)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            stderr_ring,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.lock().expect("tx lock").is_none()
    }

    /// Send one request and await its response within `timeout`. On expiry
    /// the pending entry is removed and `Timeout` surfaces; the caller is
    /// expected to tear the connection down.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> PatchbayResult<Value> {
        let sender = self
            .tx
            .lock()
            .expect("tx lock")
            .clone()
            .ok_or_else(|| PatchbayError::TransportFailure("connection closed".to_string()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(PatchbayError::TransportFailure(
                "connection closed".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock")
            .insert(id, reply_tx);
        // The reader may have drained the pending map between the closed
        // check above and our insert; re-check so the call fails fast instead
        // of waiting out its deadline.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().expect("pending map lock").remove(&id);
            return Err(PatchbayError::TransportFailure(
                "connection closed".to_string(),
            ));
        }

        let request = Request::new(id, method, params);
        if sender.send(rpc::to_line(&request)).is_err() {
            self.pending.lock().expect("pending map lock").remove(&id);
            return Err(PatchbayError::TransportFailure(
                "writer task gone".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) if err.code == rpc::INTERNAL_ERROR && err.message == "connection closed" => {
                Err(PatchbayError::TransportFailure(format!(
                    "server '{}' closed the connection",
                    self.server
                )))
            }
            Ok(Ok(Err(err))) => Err(PatchbayError::Downstream {
                code: err.code,
                message: err.message,
            }),
            Ok(Err(_)) => Err(PatchbayError::TransportFailure(
                "reply channel dropped".to_string(),
            )),
            Err(_) => {
                self.pending.lock().expect("pending map lock").remove(&id);
                Err(PatchbayError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Send a notification (no id, no response).
    pub fn notify(&self, method: &str, params: Value) -> PatchbayResult<()> {
        let sender = self
            .tx
            .lock()
            .expect("tx lock")
            .clone()
            .ok_or_else(|| PatchbayError::TransportFailure("connection closed".to_string()))?;
        let note = Request::notification(method, params);
        sender
            .send(rpc::to_line(&note))
            .map_err(|_| PatchbayError::TransportFailure("writer task gone".to_string()))
    }

    /// Copy of the most recent stderr lines.
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr_ring
            .lock()
            .expect("stderr ring lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Graceful close: drop stdin (EOF lets well-behaved servers exit), wait
    /// a grace period, then kill.
    pub async fn shutdown(&self) {
        // Closing the channel ends the writer task, dropping stdin.
        self.tx.lock().expect("tx lock").take();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("server '{}' exited: {}", self.server, status);
                }
                Ok(Err(e)) => warn!("wait for '{}' failed: {}", self.server, e),
                Err(_) => {
                    warn!("server '{}' ignored EOF, killing", self.server);
                    let _ = child.kill().await;
                }
            }
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}
