use serde::{Deserialize, Serialize};

use trail_engine::EngineError;

/// JSON-RPC style request.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Response envelope: `{ id, success, result?, error?: { code: String, message } }`
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_FOUND: i32 = -32004;

/// Numeric codes route internally; the wire carries the string form.
pub fn error_code_to_string(code: i32) -> &'static str {
    match code {
        PARSE_ERROR => "PARSE_ERROR",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        NOT_FOUND => "NOT_FOUND",
        _ => "UNKNOWN_ERROR",
    }
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: error_code_to_string(code).to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, msg)
    }

    pub fn not_found(id: Option<serde_json::Value>, what: impl Into<String>) -> Self {
        Self::error(id, NOT_FOUND, what)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }

    /// Map an engine failure onto the closest wire code.
    pub fn from_engine(id: Option<serde_json::Value>, err: &EngineError) -> Self {
        let code = match err {
            e if e.is_not_found() => NOT_FOUND,
            EngineError::InvalidInput(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self::error(id, code, err.to_string())
    }

    /// Serialize `value` as the result, or report why it could not be.
    pub fn from_value<T: Serialize>(id: Option<serde_json::Value>, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::success(id, v),
            Err(e) => Self::internal_error(id, e.to_string()),
        }
    }
}

/// Extract a required string param from the RPC params object.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// A non-negative integer param, clamped to `u32`.
pub fn optional_u32(params: &serde_json::Value, key: &str) -> Option<u32> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rpc_request() {
        let json = r#"{"method":"object.get","params":{"id":"tab_123"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "object.get");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn success_response_omits_error() {
        let resp = RpcResponse::success(Some(serde_json::json!(1)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn engine_errors_map_to_wire_codes() {
        let resp = RpcResponse::from_engine(None, &EngineError::NotFound("tab tab_x".into()));
        assert_eq!(resp.error.unwrap().code, "NOT_FOUND");
        let resp = RpcResponse::from_engine(None, &EngineError::InvalidInput("bad".into()));
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
        let resp = RpcResponse::from_engine(None, &EngineError::Internal("boom".into()));
        assert_eq!(resp.error.unwrap().code, "INTERNAL_ERROR");
    }

    #[test]
    fn param_helpers() {
        let params = serde_json::json!({"query": "rust", "limit": -5, "big": 1u64 << 40});
        assert_eq!(require_str(&params, "query").unwrap(), "rust");
        assert!(require_str(&params, "missing").unwrap_err().contains("missing"));
        assert_eq!(optional_u32(&params, "limit"), Some(0));
        assert_eq!(optional_u32(&params, "big"), Some(u32::MAX));
        assert_eq!(optional_str(&params, "nope"), None);
    }
}
