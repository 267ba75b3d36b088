//! The `Transport` capability (spec §9 "Two transports") and its two
//! implementations. Dispatcher code is transport-agnostic: both stdio and
//! HTTP+SSE speak the same JSON-RPC 2.0 envelope.

pub mod http;
pub mod stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;

///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn err(id: Option<Value>, error: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// Routes one parsed JSON-RPC request to the dispatcher and produces the
/// response object (spec §4.6 "three JSON-RPC methods"). Shared by both
/// transport implementations so error mapping stays consistent across them.
pub async fn handle_request(
    dispatcher: &crate::dispatch::Dispatcher,
    request: JsonRpcRequest,
    verbose_errors: bool,
) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::ok(id, crate::dispatch::initialize_response()),
        "tools/list" => JsonRpcResponse::ok(id, dispatcher.list_tools()),
        "tools/call" => {
            let name = request.params.get("name").and_then(|v| v.as_str()).map(str::to_string);
            let arguments = request.params.get("arguments").cloned().unwrap_or(Value::Null);
            match name {
                Some(name) => match dispatcher.call_tool(&name, arguments).await {
                    Ok(result) => JsonRpcResponse::ok(id, result),
                    Err(e) => JsonRpcResponse::err(id, e.to_rpc_error(verbose_errors)),
                },
                None => JsonRpcResponse::err(
                    id,
                    crate::error::BridgeError::ArgumentError("missing tool name".to_string()).to_rpc_error(verbose_errors),
                ),
            }
        }
        other => JsonRpcResponse::err(
            id,
            serde_json::json!({ "code": -32601, "message": format!("method not found: {other}") }),
        ),
    }
}
