//! JSON-lines front end for [`RequestGateway`].
//!
//! Each input line is `{"id": .., "channel": "cpp-compiler:<op>", "payload": {..}}`
//! and produces exactly one output line carrying the same `id` with either a
//! `result` or an `error`. Requests run concurrently, so replies may come back
//! out of order.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::gateway::{CompileRequest, ExecuteRequest, RequestGateway};

pub const CHANNEL_CHECK_AVAILABILITY: &str = "cpp-compiler:check-availability";
pub const CHANNEL_COMPILE: &str = "cpp-compiler:compile";
pub const CHANNEL_EXECUTE: &str = "cpp-compiler:execute";
pub const CHANNEL_CLEANUP: &str = "cpp-compiler:cleanup";

#[derive(Deserialize, Debug)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub reason: String,
    pub code: u32,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, reason: &str, code: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                reason: reason.to_string(),
                code,
                message: message.into(),
            }),
        }
    }

    fn invalid_argument(id: Value, message: impl Into<String>) -> Self {
        Self::error(id, "ERR_INVALID_ARGUMENT", 1, message)
    }

    fn internal(id: Value, message: impl Into<String>) -> Self {
        Self::error(id, "ERR_INTERNAL", 6, message)
    }
}

/// Answers one raw request line
pub async fn dispatch(gateway: &RequestGateway, line: &str) -> Reply {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle(gateway, request).await,
        Err(e) => Reply::invalid_argument(Value::Null, format!("malformed request: {e}")),
    }
}

async fn handle(gateway: &RequestGateway, request: Request) -> Reply {
    let Request {
        id,
        channel,
        payload,
    } = request;

    let result = match channel.as_str() {
        CHANNEL_CHECK_AVAILABILITY => serde_json::to_value(gateway.check_availability().await),
        CHANNEL_COMPILE => {
            let request: CompileRequest = match serde_json::from_value(payload) {
                Ok(request) => request,
                Err(e) => return Reply::invalid_argument(id, format!("invalid compile request: {e}")),
            };
            serde_json::to_value(gateway.compile(&request).await)
        }
        CHANNEL_EXECUTE => {
            let request: ExecuteRequest = match serde_json::from_value(payload) {
                Ok(request) => request,
                Err(e) => return Reply::invalid_argument(id, format!("invalid execute request: {e}")),
            };
            serde_json::to_value(gateway.execute(&request).await)
        }
        CHANNEL_CLEANUP => serde_json::to_value(gateway.cleanup().await),
        other => {
            return Reply::error(id, "ERR_NOT_FOUND", 3, format!("unknown channel `{other}`"));
        }
    };

    match result {
        Ok(value) => Reply::ok(id, value),
        Err(e) => Reply::internal(id, format!("failed to encode response: {e}")),
    }
}

/// Serves requests from `reader` until EOF or cancellation
///
/// In-flight requests are drained and their replies written before the
/// gateway is cleaned up and the function returns.
pub async fn serve<R, W>(
    reader: R,
    mut writer: W,
    gateway: Arc<RequestGateway>,
    token: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();
    let mut lines = BufReader::new(reader).lines();
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!(target: "cppbox::ipc", "Shutdown requested, no longer accepting requests");
                break;
            }

            Some(reply) = rx.recv() => {
                write_reply(&mut writer, &reply).await?;
            }

            Some(res) = requests.join_next(), if !requests.is_empty() => {
                report_task(res);
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        requests.spawn(run_request(Arc::clone(&gateway), line, tx.clone()));
                    }
                    Ok(None) => {
                        log::info!(target: "cppbox::ipc", "Input closed");
                        break;
                    }
                    Err(e) => {
                        log::error!(target: "cppbox::ipc", "Failed to read request: {e}");
                        break;
                    }
                }
            }
        }
    }

    if !requests.is_empty() {
        log::info!(
            target: "cppbox::ipc",
            "Waiting for {} in-flight request(s)",
            requests.len()
        );
    }
    while let Some(res) = requests.join_next().await {
        report_task(res);
    }
    drop(tx);
    while let Some(reply) = rx.recv().await {
        write_reply(&mut writer, &reply).await?;
    }

    let cleanup = gateway.cleanup().await;
    if let Some(error) = cleanup.error {
        log::warn!(target: "cppbox::ipc", "Cleanup on shutdown failed: {error}");
    }
    Ok(())
}

/// Runs one request in its own task so a panic becomes an error reply
async fn run_request(gateway: Arc<RequestGateway>, line: String, tx: mpsc::UnboundedSender<Reply>) {
    let id = serde_json::from_str::<Value>(&line)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null);

    let handle = tokio::spawn(async move { dispatch(&gateway, &line).await });
    let reply = match handle.await {
        Ok(reply) => reply,
        Err(e) => {
            log::error!(target: "cppbox::ipc", "Request {id} failed: {e}");
            Reply::internal(id, format!("request handler failed: {e}"))
        }
    };

    if tx.send(reply).is_err() {
        log::warn!(target: "cppbox::ipc", "Reply dropped, writer is gone");
    }
}

fn report_task(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            log::error!(target: "cppbox::ipc", "Request task panicked: {e:?}");
        } else {
            log::error!(target: "cppbox::ipc", "Request task finished with error: {e:?}");
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
