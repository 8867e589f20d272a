//! Control-plane RPC frames.
//!
//! One WebSocket to the backend carries JSON frames in both directions. A
//! frame with a `method` is a request; a frame with a `status` is a
//! response. Status codes follow HTTP conventions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

impl RpcRequest {
    pub fn new(method: &str, path: &str, body: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: None,
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: &str, body: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            status: 200,
            headers: None,
            body,
            error: None,
        }
    }

    pub fn error(id: &str, status: u16, message: &str) -> Self {
        Self {
            id: id.to_string(),
            status,
            headers: None,
            body: serde_json::Value::Null,
            error: Some(message.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Classify an incoming frame without fully deserializing it.
#[derive(Debug)]
pub enum Frame {
    Request(RpcRequest),
    Response(RpcResponse),
    Unknown(serde_json::Value),
}

pub fn classify(value: serde_json::Value) -> Frame {
    if value.get("method").is_some_and(|m| !m.is_null()) {
        match serde_json::from_value(value.clone()) {
            Ok(request) => Frame::Request(request),
            Err(_) => Frame::Unknown(value),
        }
    } else if value.get("status").is_some_and(|s| !s.is_null()) {
        match serde_json::from_value(value.clone()) {
            Ok(response) => Frame::Response(response),
            Err(_) => Frame::Unknown(value),
        }
    } else {
        Frame::Unknown(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_classify_by_discriminating_field() {
        let req = serde_json::json!({
            "id": "X", "method": "POST", "path": "/api/server/ping"
        });
        assert!(matches!(classify(req), Frame::Request(_)));

        let resp = serde_json::json!({ "id": "X", "status": 200, "body": {} });
        assert!(matches!(classify(resp), Frame::Response(_)));

        let junk = serde_json::json!({ "id": "X" });
        assert!(matches!(classify(junk), Frame::Unknown(_)));
    }

    #[test]
    fn null_body_omitted_on_the_wire() {
        let request = RpcRequest::new("GET", "/api/ws/status", serde_json::Value::Null);
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(!encoded.contains("\"body\""));
        assert!(!encoded.contains("\"headers\""));
    }

    #[test]
    fn status_ranges() {
        assert!(RpcResponse::ok("a", serde_json::Value::Null).is_success());
        assert!(!RpcResponse::error("a", 404, "unknown endpoint").is_success());
    }
}
