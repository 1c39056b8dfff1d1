//! Line-delimited JSON-RPC 2.0 server over stdin/stdout.
//!
//! Methods: `initialize`, `ping`, `tools/list`, `tools/call`. Requests
//! without an id are notifications and get no response. Tool calls run
//! concurrently; responses are written in completion order, one JSON object
//! per line.
//!
//! The caller's capabilities are fixed by `ServerOptions`; a call's `_meta`
//! may only name the user. Lines longer than `max_line_bytes` are discarded
//! and answered with an invalid-request error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::tools::CallerIdentity;

const JSONRPC_VERSION: &str = "2.0";
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
const PROTOCOL_VERSION: &str = "2024-11-05";

// Standard JSON-RPC error codes
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    #[serde(default, rename = "_meta")]
    meta: Option<CallMeta>,
}

/// Per-call metadata. Anything besides `user_id` is ignored.
#[derive(Debug, Default, Deserialize)]
struct CallMeta {
    #[serde(default)]
    user_id: Option<String>,
}

// =============================================================================
// Server
// =============================================================================

/// Settings the server needs beyond the dispatcher.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Session identity. Its user id is the default when a call names none;
    /// its capabilities apply to every call.
    pub caller: CallerIdentity,
    pub server_name: String,
    /// Longest accepted request line, newline excluded.
    pub max_line_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            caller: CallerIdentity::user("local"),
            server_name: "platewise-mcp".to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ServerOptions {
    fn caller_for(&self, meta: CallMeta) -> CallerIdentity {
        match meta.user_id {
            Some(user_id) => CallerIdentity {
                user_id,
                ..self.caller.clone()
            },
            None => self.caller.clone(),
        }
    }
}

/// One unit read from the input.
#[derive(Debug, PartialEq)]
enum Frame {
    Line(Vec<u8>),
    Oversized,
}

/// Newline-delimited reader that buffers at most `max_bytes` of a line.
///
/// Cancel safe: all state is in the struct and `fill_buf` is the only await.
struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    discarding: bool,
    max_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(inner: R, max_bytes: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            discarding: false,
            max_bytes,
        }
    }

    async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(Frame::Oversized));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let used = chunk.len() + usize::from(newline.is_some());
            if !self.discarding {
                if self.buf.len() + chunk.len() > self.max_bytes {
                    self.discarding = true;
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }
            self.inner.consume(used);

            if newline.is_some() {
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(Frame::Oversized));
                }
                return Ok(Some(Frame::Line(std::mem::take(&mut self.buf))));
            }
        }
    }
}

/// Serve on the process's stdin/stdout until stdin closes.
pub async fn serve_stdio(dispatcher: Arc<Dispatcher>, options: ServerOptions) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(dispatcher, options, stdin, stdout).await
}

/// Serve requests read from `input`, writing responses to `output`.
///
/// Returns once `input` reaches EOF and every in-flight call has answered.
pub async fn serve<R, W>(
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let options = Arc::new(options);
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let mut reader = LineReader::new(input, options.max_line_bytes);
    let mut reading = true;
    let mut in_flight = 0usize;

    tracing::info!(tools = dispatcher.registry().len(), "stdio server ready");

    loop {
        tokio::select! {
            frame = reader.next_frame(), if reading => {
                match frame? {
                    Some(Frame::Line(bytes)) => {
                        let routed = match std::str::from_utf8(&bytes) {
                            Ok(line) => route(&dispatcher, &options, &tx, line.trim()),
                            Err(_) => Routed::Reply(parse_error()),
                        };
                        match routed {
                            Routed::Reply(response) => write_response(&mut output, &response).await?,
                            Routed::Spawned => in_flight += 1,
                            Routed::Ignored => {}
                        }
                    }
                    Some(Frame::Oversized) => {
                        tracing::warn!(
                            max_line_bytes = options.max_line_bytes,
                            "request line too large, discarded"
                        );
                        let response =
                            JsonRpcResponse::err(Value::Null, INVALID_REQUEST, "Request too large");
                        write_response(&mut output, &response).await?;
                    }
                    None => {
                        tracing::debug!(in_flight, "input closed, draining in-flight calls");
                        reading = false;
                    }
                }
            }
            Some(response) = rx.recv(), if in_flight > 0 => {
                in_flight -= 1;
                write_response(&mut output, &response).await?;
            }
            else => break,
        }
    }

    tracing::info!("stdio server stopped");
    Ok(())
}

fn parse_error() -> JsonRpcResponse {
    JsonRpcResponse::err(Value::Null, PARSE_ERROR, "Parse error")
}

enum Routed {
    Reply(JsonRpcResponse),
    Spawned,
    Ignored,
}

/// Parse and route one line. Tool calls are spawned and answer through `tx`.
fn route(
    dispatcher: &Arc<Dispatcher>,
    options: &Arc<ServerOptions>,
    tx: &mpsc::UnboundedSender<JsonRpcResponse>,
    line: &str,
) -> Routed {
    if line.is_empty() {
        return Routed::Ignored;
    }

    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::debug!(error = %err, "unparseable request");
            return Routed::Reply(parse_error());
        }
    };

    // Notifications get no response
    let Some(id) = request.id else {
        return Routed::Ignored;
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Routed::Reply(JsonRpcResponse::err(
            id,
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": options.server_name,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => JsonRpcResponse::ok(id, json!({})),
        "tools/list" => JsonRpcResponse::ok(
            id,
            json!({"tools": dispatcher.registry().to_protocol_list()}),
        ),
        "tools/call" => {
            let params: CallParams = match request
                .params
                .map(serde_json::from_value)
                .unwrap_or_else(|| serde_json::from_value(Value::Null))
            {
                Ok(params) => params,
                Err(err) => {
                    return Routed::Reply(JsonRpcResponse::err(
                        id,
                        INVALID_PARAMS,
                        format!("Invalid params: {}", err),
                    ))
                }
            };
            spawn_call(dispatcher.clone(), options.clone(), tx.clone(), id, params);
            return Routed::Spawned;
        }
        other => JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    Routed::Reply(response)
}

fn spawn_call(
    dispatcher: Arc<Dispatcher>,
    options: Arc<ServerOptions>,
    tx: mpsc::UnboundedSender<JsonRpcResponse>,
    id: Value,
    params: CallParams,
) {
    tokio::spawn(async move {
        let caller = options.caller_for(params.meta.unwrap_or_default());
        let result = dispatcher
            .dispatch(&params.name, params.arguments, &caller)
            .await;
        let envelope = result.to_envelope();
        let response = JsonRpcResponse::ok(
            id,
            json!({
                "content": [{"type": "text", "text": envelope.to_string()}],
                "structuredContent": envelope,
                "isError": !result.is_success(),
            }),
        );
        if tx.send(response).is_err() {
            tracing::warn!(tool = %params.name, "response dropped, server stopped");
        }
    });
}

async fn write_response<W>(output: &mut W, response: &JsonRpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{handler_fn, str_arg, ParamDef, ParamType, ToolDescriptor, ToolError, ToolRegistry};

    fn dispatcher() -> Arc<Dispatcher> {
        let handler = handler_fn(
            vec![ParamDef::new("text", ParamType::String)],
            |ctx, args| async move {
                Ok::<_, ToolError>(json!({"echo": str_arg(&args, "text")?, "user": ctx.user_id()}))
            },
        );
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::builder("echo", handler).description("Echo text").build())
            .unwrap();
        Arc::new(Dispatcher::builder(Arc::new(registry)).build())
    }

    async fn run(input: &str) -> Vec<Value> {
        run_with(ServerOptions::default(), input).await
    }

    async fn run_with(options: ServerOptions, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        serve(dispatcher(), options, input.as_bytes(), &mut output)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let out = run(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
        ))
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["result"]["serverInfo"]["name"], "platewise-mcp");
        assert_eq!(out[1], json!({"jsonrpc": "2.0", "result": {}, "id": 2}));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let out = run("{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n").await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_parse_and_method_errors() {
        let out = run("not json\n{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"nope\"}\n").await;
        assert_eq!(out[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(out[0]["id"], Value::Null);
        assert_eq!(out[1]["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_call_uses_default_user() {
        let out = run(
            "{\"jsonrpc\":\"2.0\",\"id\":\"a\",\"method\":\"tools/call\",\"params\":{\"name\":\"echo\",\"arguments\":{\"text\":\"hi\"}}}\n",
        )
        .await;
        assert_eq!(out.len(), 1);
        let result = &out[0]["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["user"], "local");
        let text: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(text["echo"], "hi");
    }

    #[tokio::test]
    async fn test_meta_names_user_only() {
        let out = run(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","#,
            r#""arguments":{"text":"hi"},"_meta":{"user_id":"bob","is_admin":true,"can_write":false}}}"#,
            "\n",
        ))
        .await;
        assert_eq!(out[0]["result"]["structuredContent"]["user"], "bob");

        let options = ServerOptions::default();
        let caller = options.caller_for(CallMeta {
            user_id: Some("bob".to_string()),
        });
        assert_eq!(caller.user_id, "bob");
        assert!(caller.can_write);
        assert!(!caller.is_admin);
    }

    #[test]
    fn test_session_capabilities_apply_to_every_call() {
        let options = ServerOptions {
            caller: CallerIdentity::read_only("kiosk"),
            ..ServerOptions::default()
        };
        let caller = options.caller_for(CallMeta::default());
        assert_eq!(caller, CallerIdentity::read_only("kiosk"));
        let named = options.caller_for(CallMeta {
            user_id: Some("carol".to_string()),
        });
        assert_eq!(named, CallerIdentity::read_only("carol"));
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_and_skipped() {
        let options = ServerOptions {
            max_line_bytes: 64,
            ..ServerOptions::default()
        };
        let input = format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"pad\":\"{}\"}}\n{}\n",
            "x".repeat(4096),
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
        );
        let out = run_with(options, &input).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["error"]["code"], INVALID_REQUEST);
        assert_eq!(out[0]["id"], Value::Null);
        assert_eq!(out[1], json!({"jsonrpc": "2.0", "result": {}, "id": 2}));
    }

    #[tokio::test]
    async fn test_line_reader_bounds_buffer() {
        let input = format!("{}\nshort\n{}", "y".repeat(100), "z".repeat(100));
        // Tiny capacity forces many fill_buf rounds per line
        let mut reader = LineReader::new(BufReader::with_capacity(8, input.as_bytes()), 16);

        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Oversized));
        assert!(reader.buf.capacity() <= 16);
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Line(b"short".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::Oversized));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_parse_error() {
        let mut output = Vec::new();
        let input: &[u8] = b"\xff\xfe\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"ping\"}\n";
        serve(dispatcher(), ServerOptions::default(), input, &mut output)
            .await
            .unwrap();
        let out: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(out[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(out[1]["id"], 5);
    }

    #[tokio::test]
    async fn test_call_missing_name_is_invalid_params() {
        let out = run("{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"tools/call\",\"params\":{}}\n").await;
        assert_eq!(out[0]["error"]["code"], INVALID_PARAMS);
    }
}
