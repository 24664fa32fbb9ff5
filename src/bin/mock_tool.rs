//! Scripted MCP tool process for exercising the bridge end to end.
//!
//! Speaks newline-delimited JSON-RPC on stdio. Behavior knobs come from
//! the environment so tests can script failure modes:
//!
//! - `MOCK_TOOL_CAPABILITIES`: comma-separated capability groups to
//!   advertise (default `tools`)
//! - `MOCK_TOOL_EXIT_CODE`: exit with this code immediately, before
//!   reading anything
//! - `MOCK_TOOL_FAIL_CALLS`: answer every `tools/call` with an error
//!
//! The single `echo` tool honors `message`, `delay_ms` and `crash`
//! arguments, and reports progress when the call carries a token.
//! Requests are handled concurrently, so a delayed call does not hold
//! up the ones behind it.

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    if let Ok(raw) = std::env::var("MOCK_TOOL_EXIT_CODE") {
        let code = raw.parse().unwrap_or(1);
        std::process::exit(code);
    }
    let fail_calls = std::env::var("MOCK_TOOL_FAIL_CALLS").is_ok();
    let capabilities = capability_set();

    // Single writer task keeps concurrent replies line-atomic
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let out_tx = out_tx.clone();
        let capabilities = capabilities.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle(message, &capabilities, fail_calls, &out_tx).await {
                let _ = out_tx.send(reply.to_string()).await;
            }
        });
    }

    drop(out_tx);
    let _ = writer.await;
}

async fn handle(
    message: Value,
    capabilities: &Value,
    fail_calls: bool,
    out_tx: &mpsc::Sender<String>,
) -> Option<Value> {
    let method = message.get("method")?.as_str()?.to_string();
    // Notifications get no reply
    let id = message.get("id").cloned()?;

    let reply = match method.as_str() {
        "initialize" => ok(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": capabilities,
                "serverInfo": { "name": "mock-tool", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => ok(id, json!({})),
        "tools/list" => ok(
            id,
            json!({
                "tools": [{
                    "name": "echo",
                    "description": "Echo a message back, with optional delay, crash and progress",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "message": { "type": "string" },
                            "delay_ms": { "type": "integer" },
                            "crash": { "type": "boolean" }
                        }
                    }
                }]
            }),
        ),
        "tools/call" => handle_call(id, &message, fail_calls, out_tx).await,
        "logging/setLevel" => ok(id, Value::Null),
        "completion/complete" => ok(
            id,
            json!({
                "completion": { "values": [], "total": 0, "hasMore": false }
            }),
        ),
        other => err(id, -32601, format!("Method not found: {}", other)),
    };
    Some(reply)
}

async fn handle_call(
    id: Value,
    message: &Value,
    fail_calls: bool,
    out_tx: &mpsc::Sender<String>,
) -> Value {
    if fail_calls {
        return err(id, -32000, "mock tool failure".to_string());
    }
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if args.get("crash").and_then(Value::as_bool).unwrap_or(false) {
        // Die without answering; the bridge must resolve the call itself
        std::process::exit(7);
    }
    // Progress goes out while the call is still running
    if let Some(token) = params.get("_meta").and_then(|meta| meta.get("progressToken")) {
        let progress = json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": { "progressToken": token, "progress": 1, "total": 1 }
        });
        let _ = out_tx.send(progress.to_string()).await;
    }
    if let Some(delay) = args.get("delay_ms").and_then(Value::as_u64) {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    let text = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    ok(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": false
        }),
    )
}

fn ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn err(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn capability_set() -> Value {
    let raw = std::env::var("MOCK_TOOL_CAPABILITIES").unwrap_or_else(|_| "tools".to_string());
    let mut caps = serde_json::Map::new();
    for group in raw.split(',') {
        let group = group.trim();
        if !group.is_empty() {
            caps.insert(group.to_string(), json!({}));
        }
    }
    Value::Object(caps)
}
