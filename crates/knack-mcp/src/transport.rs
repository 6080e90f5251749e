//! Transports carrying JSON-RPC frames to a tool server.
//!
//! A transport owns the correlation state for exactly one connection
//! generation. Reconnecting builds a fresh transport with a fresh
//! pending map, so an answer from a previous server process can never
//! reach a caller from the current one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{CallError, ConnectError};
use crate::wire::{Notification, Request, Response};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// One open channel to a tool server.
///
/// `request` resolves the JSON-RPC envelope: an error object becomes
/// `CallError::Rejected`, otherwise the raw `result` value is returned.
pub trait Transport: Send + Sync {
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>>;

    fn notify<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;

    /// Tear the channel down. Every pending call resolves with
    /// `ChannelClosed`, and later calls fail fast with the same error.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

fn resolve(resp: Response) -> Result<Value, CallError> {
    if let Some(err) = resp.error {
        return Err(CallError::Rejected {
            message: format!("{} (code {})", err.message, err.code),
        });
    }
    Ok(resp.result.unwrap_or(Value::Null))
}

/// A spawned child process speaking newline-delimited JSON-RPC on
/// stdin/stdout. Stderr is discarded.
#[derive(Debug)]
pub struct StdioTransport {
    server: String,
    next_id: AtomicU64,
    write_tx: mpsc::Sender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl StdioTransport {
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, ConnectError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConnectError::Spawn {
                server: server.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (write_tx, write_rx) = mpsc::channel::<String>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(write_loop(stdin, write_rx));
        let reader_task = tokio::spawn(read_loop(
            server.to_string(),
            stdout,
            pending.clone(),
            closed.clone(),
        ));

        debug!(server, command, "spawned tool server process");

        Ok(Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            write_tx,
            pending,
            closed,
            child: Arc::new(Mutex::new(Some(child))),
            reader_task,
            writer_task,
        })
    }

    async fn do_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| CallError::Protocol(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CallError::ChannelClosed);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(resp)) => resolve(resp),
            // Sender dropped: the reader saw EOF or the channel closed.
            Ok(Err(_)) => Err(CallError::ChannelClosed),
            Err(_) => {
                // Deadline passed. Release the slot so a late answer is
                // discarded instead of delivered.
                self.pending.lock().await.remove(&id);
                Err(CallError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    async fn do_notify(&self, method: &str, params: Option<Value>) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::ChannelClosed);
        }
        let frame = serde_json::to_string(&Notification::new(method, params))
            .map_err(|e| CallError::Protocol(format!("failed to encode notification: {e}")))?;
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| CallError::ChannelClosed)
    }

    async fn do_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
        // Aborting the writer drops the child's stdin, which is the
        // polite shutdown signal for a stdio server.
        self.writer_task.abort();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server, %status, "tool server exited"),
                Ok(Err(e)) => {
                    warn!(server = %self.server, error = %e, "error waiting for tool server")
                }
                Err(_) => {
                    warn!(server = %self.server, "tool server did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.reader_task.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Transport for StdioTransport {
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>> {
        Box::pin(self.do_request(method, params, deadline))
    }

    fn notify<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(self.do_notify(method, params))
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.do_close())
    }
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    server: String,
    stdout: ChildStdout,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Response>(line) {
                    Ok(resp) => {
                        let Some(id) = resp.id else {
                            debug!(server = %server, "ignoring frame without id");
                            continue;
                        };
                        let sender = pending.lock().await.remove(&id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => {
                                debug!(server = %server, id, "discarding answer with no pending call")
                            }
                        }
                    }
                    Err(e) => warn!(server = %server, error = %e, "ignoring unparseable frame"),
                }
            }
            // EOF, the server exited.
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, error = %e, "read error on tool server stdout");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with ChannelClosed.
    pending.lock().await.clear();
}

/// JSON-RPC POSTed to a fixed HTTP endpoint, one request per exchange.
/// Responses must be plain JSON bodies; streaming responses are not
/// supported.
#[derive(Debug)]
pub struct HttpTransport {
    server: String,
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, ConnectError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            let parsed_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectError::Transport {
                    server: server.to_string(),
                    message: format!("invalid header name '{name}': {e}"),
                })?;
            let parsed_value =
                reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                    ConnectError::Transport {
                        server: server.to_string(),
                        message: format!("invalid value for header '{name}': {e}"),
                    }
                })?;
            header_map.insert(parsed_name, parsed_value);
        }
        let http = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| ConnectError::Transport {
                server: server.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            server: server.to_string(),
            url: url.to_string(),
            http,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    async fn do_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(id, method, params);

        let exchange = async {
            let http_resp = self
                .http
                .post(&self.url)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let status = http_resp.status();
            if !status.is_success() {
                return Err(CallError::Rejected {
                    message: format!("HTTP {status}"),
                });
            }
            http_resp
                .json::<Response>()
                .await
                .map_err(|e| CallError::Protocol(format!("invalid response body: {e}")))
        };

        let resp = match timeout(deadline, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CallError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
        };
        if resp.id != Some(id) {
            warn!(server = %self.server, expected = id, got = ?resp.id, "correlation id mismatch");
            return Err(CallError::Protocol(format!(
                "answer correlates to id {:?}, expected {id}",
                resp.id
            )));
        }
        resolve(resp)
    }

    async fn do_notify(&self, method: &str, params: Option<Value>) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::ChannelClosed);
        }
        let note = Notification::new(method, params);
        let resp = self
            .http
            .post(&self.url)
            .json(&note)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !resp.status().is_success() {
            return Err(CallError::Rejected {
                message: format!("HTTP {}", resp.status()),
            });
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>> {
        Box::pin(self.do_request(method, params, deadline))
    }

    fn notify<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(self.do_notify(method, params))
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(std::future::ready(()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> CallError {
    if e.is_connect() {
        CallError::ChannelClosed
    } else {
        CallError::Protocol(e.to_string())
    }
}
