//! JSON-RPC 2.0 framing and dispatch.
//!
//! Messages are newline-delimited JSON objects over an arbitrary
//! reader/writer pair. A single reader owns the decode position;
//! responses may be written from many concurrent handler tasks, so the
//! writer is guarded by a mutex that preserves frame boundaries.
//!
//! Two wire behaviors are deliberate and tested:
//!
//! - **Numeric id normalization** — ids decoded as integral floats
//!   (`1.0`) are converted to integers (`1`) and echoed that way.
//!   Strings and true fractional numbers pass through untouched.
//! - **Parse-error termination** — malformed JSON leaves the stream in
//!   an undefined state, so the server emits one `-32700` response and
//!   closes the connection. Well-formed-but-invalid requests do not
//!   terminate.
//!
//! Handler errors carry their own codes; the framing layer never
//! coerces them to `-32603`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

// Standard JSON-RPC 2.0 codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Server-specific codes in the -32000..-32099 range.
pub const SERVER_NOT_FOUND: i64 = -32000;
pub const SERVER_CANCELED: i64 = -32001;
pub const SERVER_PATH_ESCAPE: i64 = -32002;
pub const SERVER_BUSY: i64 = -32003;

/// Request id after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestId {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl RequestId {
    /// Normalize a decoded JSON id: integral floats collapse to
    /// integers; strings and fractional numbers are preserved.
    pub fn from_value(value: &Value) -> RequestId {
        match value {
            Value::Null => RequestId::Null,
            Value::String(s) => RequestId::Str(s.clone()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RequestId::Int(i)
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        RequestId::Int(f as i64)
                    } else {
                        RequestId::Float(f)
                    }
                } else {
                    RequestId::Null
                }
            }
            _ => RequestId::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Int(i) => Value::from(*i),
            RequestId::Float(f) => Value::from(*f),
            RequestId::Str(s) => Value::from(s.clone()),
            RequestId::Null => Value::Null,
        }
    }
}

/// Error payload carried in a JSON-RPC error response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        RpcError {
            code: e.rpc_code(),
            message: e.to_string(),
            data: Some(serde_json::json!({ "kind": format!("{:?}", e.kind()) })),
        }
    }
}

/// Per-request context handed to method handlers.
#[derive(Clone)]
pub struct RequestContext {
    /// Correlation id echoed in error payloads and logs.
    pub request_id: String,
    pub cancel: CancelToken,
}

/// A dispatchable method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, params: Value, ctx: RequestContext)
        -> std::result::Result<Value, RpcError>;
}

/// Method-name → handler table with exact string matching.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(
        &self,
        method: &str,
        params: Value,
        ctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        match self.handlers.get(method) {
            Some(handler) => handler.call(params, ctx).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }
}

/// Serialized access to the response writer. The `closed` flag is
/// flipped under the same lock as the final write, so no response can
/// follow a parse-error response.
struct ResponseWriter<W> {
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    async fn write(&self, response: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write a final response and refuse all subsequent writes.
    async fn write_final(&self, response: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn success_response(id: &RequestId, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "result": result,
    })
}

fn error_response(id: &RequestId, error: &RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "error": error,
    })
}

/// Drive one connection: read newline-delimited requests, dispatch
/// concurrently, write responses in completion order. Returns when the
/// stream ends, a parse error terminates it, or `cancel` fires.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    cancel: CancelToken,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let writer = Arc::new(ResponseWriter::new(writer));
    let mut in_flight = tokio::task::JoinSet::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            // Wake periodically so cancellation is honored while the
            // reader is idle.
            () = tokio::time::sleep(Duration::from_millis(250)) => {
                if cancel.is_canceled() {
                    break;
                }
                continue;
            }
        };
        if cancel.is_canceled() {
            break;
        }

        let Some(line) = line else {
            break; // EOF
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // The stream cannot be re-synchronized mid-object:
                // answer once, then hang up.
                let error = RpcError::new(PARSE_ERROR, format!("parse error: {e}"));
                metrics.record_error(PARSE_ERROR);
                writer.write_final(&error_response(&RequestId::Null, &error)).await?;
                in_flight.abort_all();
                return Ok(());
            }
        };

        let (id, method, params) = match validate_request(&value) {
            Ok(parts) => parts,
            Err(error) => {
                metrics.record_error(error.code);
                let id = value
                    .get("id")
                    .map(RequestId::from_value)
                    .unwrap_or(RequestId::Null);
                writer.write(&error_response(&id, &error)).await?;
                continue;
            }
        };

        // Notifications get no response.
        let Some(id) = id else {
            continue;
        };

        let dispatcher = dispatcher.clone();
        let writer = writer.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        in_flight.spawn(async move {
            let ctx = RequestContext {
                request_id: uuid::Uuid::new_v4().to_string(),
                cancel,
            };
            let started = Instant::now();
            metrics.record_request(&method);
            tracing::debug!(method = %method, request_id = %ctx.request_id, "dispatching");

            let request_id = ctx.request_id.clone();
            let outcome = dispatcher.dispatch(&method, params, ctx).await;
            metrics.record_request_latency(&method, started.elapsed());

            let response = match outcome {
                Ok(result) => success_response(&id, result),
                Err(mut error) => {
                    metrics.record_error(error.code);
                    // Attach enough context for a client-side LLM to
                    // explain the failure.
                    let mut data = match error.data.take() {
                        Some(Value::Object(map)) => map,
                        Some(other) => {
                            let mut map = serde_json::Map::new();
                            map.insert("detail".to_string(), other);
                            map
                        }
                        None => serde_json::Map::new(),
                    };
                    data.insert("method".to_string(), Value::from(method.clone()));
                    data.insert(
                        "elapsed_ms".to_string(),
                        Value::from(started.elapsed().as_millis() as u64),
                    );
                    data.insert("request_id".to_string(), Value::from(request_id));
                    error.data = Some(Value::Object(data));
                    error_response(&id, &error)
                }
            };

            if let Err(e) = writer.write(&response).await {
                tracing::warn!(error = %e, "failed to write response");
            }
        });
    }

    // Drain outstanding handlers before returning.
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

type ValidatedRequest = (Option<RequestId>, String, Value);

fn validate_request(value: &Value) -> std::result::Result<ValidatedRequest, RpcError> {
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::new(INVALID_REQUEST, "request must be a JSON object"))?;

    match obj.get("jsonrpc").and_then(|v| v.as_str()) {
        Some("2.0") => {}
        _ => {
            return Err(RpcError::new(
                INVALID_REQUEST,
                "jsonrpc field must be \"2.0\"",
            ))
        }
    }

    let method = obj
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::new(INVALID_REQUEST, "method field must be a string"))?
        .to_string();

    let id = match obj.get("id") {
        None => None,
        Some(v @ (Value::Null | Value::String(_) | Value::Number(_))) => {
            Some(RequestId::from_value(v))
        }
        Some(_) => {
            return Err(RpcError::new(
                INVALID_REQUEST,
                "id must be a string, number, or null",
            ))
        }
    };

    let params = obj.get("params").cloned().unwrap_or(Value::Null);
    if !matches!(params, Value::Null | Value::Object(_) | Value::Array(_)) {
        return Err(RpcError::new(
            INVALID_REQUEST,
            "params must be an object or array",
        ));
    }

    Ok((id, method, params))
}
