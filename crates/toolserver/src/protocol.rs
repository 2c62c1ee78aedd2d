//! JSON-RPC 2.0 types for the tool-server protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pv_domain::tool::ToolOutcome;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests / responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-server payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool definition discovered via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<RemoteToolDef>,
}

/// One content block of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "data")]
    Data {
        /// Base64-encoded bytes.
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallResult {
    /// Normalize into the {text, data, structured} triple.
    pub fn into_outcome(self) -> ToolOutcome {
        let mut text_parts: Vec<String> = Vec::new();
        let mut data: Option<String> = None;
        for block in self.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::Data { data: d, .. } => {
                    if data.is_none() {
                        data = Some(d);
                    }
                }
            }
        }
        ToolOutcome {
            text: if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            },
            data,
            structured: self.structured_content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_null_params() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn response_into_result() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"x":1}}"#).unwrap();
        assert_eq!(ok.into_result().unwrap()["x"], 1);

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert!(err.into_result().is_err());
    }

    #[test]
    fn call_result_normalizes_to_triple() {
        let result: CallResult = serde_json::from_str(
            r#"{
                "content": [
                    {"type":"text","text":"one"},
                    {"type":"text","text":"two"},
                    {"type":"data","data":"Ym9keQ==","mimeType":"application/octet-stream"}
                ],
                "structuredContent": {"ok": true}
            }"#,
        )
        .unwrap();
        let outcome = result.into_outcome();
        assert_eq!(outcome.text.as_deref(), Some("one\ntwo"));
        assert_eq!(outcome.data.as_deref(), Some("Ym9keQ=="));
        assert_eq!(outcome.structured.unwrap()["ok"], true);
    }

    #[test]
    fn empty_call_result_is_empty_outcome() {
        let outcome = CallResult::default().into_outcome();
        assert!(outcome.is_empty());
    }
}
