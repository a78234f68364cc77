// src/rpc/types.rs
//! JSON-RPC 2.0 envelope types shared by the TCP transport and the HTTP
//! `/jsonrpc` endpoint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<T>,
    pub id: u64,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: &str, params: Vec<T>, id: u64) -> Self {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: u64,
}

impl<T> JsonRpcResponse<T> {
    pub fn result(result: T, id: u64) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: JsonRpcError, id: u64) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

pub const ERR_PARSE: i32 = -32700;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_SERVER: i32 = -32000;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_request() {
        let request = JsonRpcRequest::new("Responder.GetCost", vec![json!({"Tenant": "t"})], 3);
        let wire = serde_json::to_string(&request).unwrap();
        assert!(wire.contains("\"jsonrpc\":\"2.0\""));
        assert!(wire.contains("\"method\":\"Responder.GetCost\""));
        assert!(wire.contains("\"id\":3"));
    }

    #[test]
    fn test_deserialize_error_response() {
        let wire = r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"NOT_FOUND"},"id":9}"#;
        let response: JsonRpcResponse<serde_json::Value> = serde_json::from_str(wire).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().message, "NOT_FOUND");
        assert_eq!(response.id, 9);
    }
}
