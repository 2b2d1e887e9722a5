//! MCP protocol types and message definitions.
//!
//! Based on the Model Context Protocol specification. Both sides of the
//! conversation live here: the bridge sends `initialize` and `tools/call`,
//! and the bundled stub server answers them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version.
pub const MCP_VERSION: &str = "2024-11-05";

// ===== JSON-RPC Base Types =====

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request with the current JSON-RPC version.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn failure(id: RequestId, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification with the current JSON-RPC version.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID (can be string or number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

// ===== Incoming Messages =====

/// One validated line of JSON-RPC traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Success { id: RequestId, result: Value },
    Failure { id: RequestId, error: JsonRpcError },
}

impl Message {
    /// Parse a single line. Anything that is not JSON, or is JSON but not a
    /// recognisable JSON-RPC message, yields `None`.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(line).ok()?;
        Self::from_value(value)
    }

    /// Classify an already-decoded JSON value.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        let method = match obj.remove("method") {
            Some(Value::String(method)) => Some(method),
            Some(_) => return None,
            None => None,
        };
        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).ok()?),
        };
        let params = obj.remove("params");

        match (method, id) {
            (Some(method), Some(id)) => Some(Message::Request(JsonRpcRequest::new(id, method, params))),
            (Some(method), None) => Some(Message::Notification(JsonRpcNotification::new(method, params))),
            (None, Some(id)) => {
                if let Some(raw) = obj.remove("error").filter(|e| !e.is_null()) {
                    let error = serde_json::from_value::<JsonRpcError>(raw).ok()?;
                    Some(Message::Failure { id, error })
                } else {
                    let result = obj.remove("result")?;
                    Some(Message::Success { id, result })
                }
            }
            (None, None) => None,
        }
    }

    /// The id this message answers, if it is a response.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            Message::Success { id, .. } | Message::Failure { id, .. } => Some(id),
            _ => None,
        }
    }
}

// ===== MCP-Specific Types =====

/// Name and version pair used for both `clientInfo` and `serverInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities the bridge declares when it connects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Roots capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Server capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// Tools capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Initialize request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// Initialize result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// List tools result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}

/// Call tool params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Tool call result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
}

impl ToolResult {
    /// Single text block result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Single text block flagged as a tool-level failure.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Text blocks in order, skipping everything else.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Content block in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        data: String,
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        #[serde(default)]
        resource: Value,
    },
    #[serde(other)]
    Other,
}

// ===== Error Codes =====

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonrpc_request_serialization() {
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "list_tasks"})));

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/call\""));
    }

    #[test]
    fn test_request_without_params_omits_field() {
        let request = JsonRpcRequest::new(7, "ping", None);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&notification).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(json.contains("notifications/initialized"));
    }

    #[test]
    fn test_parse_success_response() {
        let msg = Message::parse(br#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(
            msg,
            Message::Success {
                id: RequestId::Number(3),
                result: json!({"ok": true}),
            }
        );
        assert_eq!(msg.response_id(), Some(&RequestId::Number(3)));
    }

    #[test]
    fn test_parse_error_response() {
        let msg = Message::parse(
            br#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match msg {
            Message::Failure { id, error } => {
                assert_eq!(id, RequestId::Number(4));
                assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(error.message, "Method not found");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_null_error_is_success() {
        let msg = Message::parse(br#"{"jsonrpc":"2.0","id":5,"result":[],"error":null}"#).unwrap();
        assert!(matches!(msg, Message::Success { .. }));
    }

    #[test]
    fn test_parse_request_and_notification() {
        let req = Message::parse(br#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#).unwrap();
        assert!(matches!(req, Message::Request(ref r) if r.method == "ping"));

        let notif = Message::parse(br#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert!(matches!(notif, Message::Notification(ref n) if n.method == "notifications/progress"));
        assert!(notif.response_id().is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Message::parse(b"not json").is_none());
        assert!(Message::parse(b"[1,2,3]").is_none());
        assert!(Message::parse(br#"{"jsonrpc":"2.0"}"#).is_none());
        assert!(Message::parse(br#"{"id":1}"#).is_none());
        assert!(Message::parse(br#"{"id":{"nested":true},"result":1}"#).is_none());
        assert!(Message::parse(br#"{"method":42}"#).is_none());
        assert!(Message::parse(br#"{"id":1,"error":"oops"}"#).is_none());
    }

    #[test]
    fn test_request_id_variants() {
        assert_eq!(serde_json::to_string(&RequestId::Number(42)).unwrap(), "42");
        assert_eq!(
            serde_json::to_string(&RequestId::String("request-1".to_string())).unwrap(),
            "\"request-1\""
        );
        assert_eq!(RequestId::Number(9).to_string(), "9");
    }

    #[test]
    fn test_initialize_params_are_camel_case() {
        let params = InitializeParams {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "assistant-bridge".to_string(),
                version: "0.3.0".to_string(),
            },
        };

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"protocolVersion\""));
        assert!(json.contains("\"clientInfo\""));
        assert!(json.contains("\"capabilities\":{}"));
    }

    #[test]
    fn test_initialize_result_tolerates_sparse_payload() {
        let result: InitializeResult = serde_json::from_value(json!({})).unwrap();
        assert!(result.server_info.is_none());
        assert!(result.capabilities.tools.is_none());

        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "cron", "version": "1.0.0"}
        }))
        .unwrap();
        assert!(result.capabilities.tools.unwrap().list_changed);
        assert_eq!(result.server_info.unwrap().name, "cron");
    }

    #[test]
    fn test_tool_result_texts_skip_other_blocks() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "audio", "data": "??"},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();

        let texts: Vec<_> = result.texts().collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(!result.is_error);
    }

    #[test]
    fn test_tool_result_is_error_wire_name() {
        let json = serde_json::to_string(&ToolResult::error("nope")).unwrap();
        assert!(json.contains("\"isError\":true"));
        assert!(json.contains("\"type\":\"text\""));
    }

    #[test]
    fn test_call_tool_params_default_arguments() {
        let params: CallToolParams = serde_json::from_value(json!({"name": "list_tasks"})).unwrap();
        assert_eq!(params.name, "list_tasks");
        assert!(params.arguments.is_empty());
    }
}
