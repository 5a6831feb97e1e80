//! JSON-RPC 2.0 surface: request/response codec, batch handling and the
//! dispatch into the method table.

pub mod service;

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use service::AppState;

pub const JSONRPC_VERSION: &str = "2.0";
/// Incoming batches are accepted with at most this many calls.
pub const BATCH_MAX_LEN: usize = 1;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    fn result(id: Option<Value>, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, error: RpcError) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        RpcError {
            code: -32600,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        RpcError {
            code: -32601,
            message: format!("method not found: {}", method),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        RpcError {
            code: -32602,
            message: message.into(),
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        RpcError {
            code: -32000,
            message: message.into(),
        }
    }
}

/// Decode method params, named or positional. A positional array is zipped
/// against the declared field order.
pub fn parse_params<T: DeserializeOwned>(
    params: Option<Value>,
    fields: &[&str],
) -> Result<T, RpcError> {
    let object = match params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(Value::Array(items)) => {
            if items.len() > fields.len() {
                return Err(RpcError::invalid_params(format!(
                    "expected at most {} positional params",
                    fields.len()
                )));
            }
            let mut map = serde_json::Map::new();
            for (field, item) in fields.iter().zip(items) {
                map.insert((*field).to_string(), item);
            }
            Value::Object(map)
        }
        Some(object @ Value::Object(_)) => object,
        Some(other) => {
            return Err(RpcError::invalid_params(format!(
                "params must be an object or array, got {}",
                other
            )))
        }
    };
    serde_json::from_value(object).map_err(|e| RpcError::invalid_params(e.to_string()))
}

/// Handle one decoded HTTP body: a single call or a batch of at most
/// [`BATCH_MAX_LEN`].
pub async fn handle_body(state: &AppState, body: Value) -> Value {
    match body {
        Value::Array(calls) => {
            if calls.is_empty() || calls.len() > BATCH_MAX_LEN {
                let err = RpcError::invalid_request(format!(
                    "batch requests are limited to {} call",
                    BATCH_MAX_LEN
                ));
                return serde_json::to_value(Response::failure(None, err))
                    .unwrap_or(Value::Null);
            }
            let mut out = Vec::with_capacity(calls.len());
            for call in calls {
                out.push(
                    serde_json::to_value(handle_call(state, call).await)
                        .unwrap_or(Value::Null),
                );
            }
            Value::Array(out)
        }
        call => serde_json::to_value(handle_call(state, call).await).unwrap_or(Value::Null),
    }
}

async fn handle_call(state: &AppState, call: Value) -> Response {
    let request: Request = match serde_json::from_value(call) {
        Ok(r) => r,
        Err(e) => {
            return Response::failure(None, RpcError::invalid_request(e.to_string()));
        }
    };

    if request.method.is_empty() {
        return Response::failure(request.id, RpcError::invalid_request("missing method"));
    }

    // Methods are registered both at the root and in the jrpc namespace.
    let method = request
        .method
        .strip_prefix("jrpc.")
        .unwrap_or(&request.method)
        .to_string();

    let id = request.id.clone();
    let started = Instant::now();
    info!(method = %method, id = ?request.id, "dispatching");

    let outcome = service::dispatch(state, &method, request.params).await;
    let duration = started.elapsed();

    match outcome {
        Ok(result) => {
            info!(method = %method, ?duration, "dispatched");
            Response::result(id, result)
        }
        Err(e) => {
            error!(method = %method, ?duration, error = %e.message, "dispatch failed");
            Response::failure(id, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    struct PvidParams {
        #[serde(rename = "Domain")]
        domain: String,
        #[serde(rename = "MAC")]
        mac: String,
        #[serde(rename = "PVID")]
        pvid: u32,
    }

    #[test]
    fn named_params_decode() {
        let params = serde_json::json!({
            "Domain": "vm01", "MAC": "52:54:00:ab:cd:ef", "PVID": 222
        });
        let p: PvidParams =
            parse_params(Some(params), &["Domain", "MAC", "PVID"]).unwrap();
        assert_eq!(p.domain, "vm01");
        assert_eq!(p.mac, "52:54:00:ab:cd:ef");
        assert_eq!(p.pvid, 222);
    }

    #[test]
    fn positional_params_decode() {
        let params = serde_json::json!(["vm01", "52:54:00:ab:cd:ef", 222]);
        let p: PvidParams =
            parse_params(Some(params), &["Domain", "MAC", "PVID"]).unwrap();
        assert_eq!(p.domain, "vm01");
        assert_eq!(p.pvid, 222);
    }

    #[test]
    fn excess_positional_params_refused() {
        let params = serde_json::json!(["vm01", "mac", 1, "extra"]);
        let err =
            parse_params::<PvidParams>(Some(params), &["Domain", "MAC", "PVID"]).unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn missing_field_is_invalid_params() {
        let params = serde_json::json!({ "Domain": "vm01" });
        let err =
            parse_params::<PvidParams>(Some(params), &["Domain", "MAC", "PVID"]).unwrap_err();
        assert_eq!(err.code, -32602);
    }
}
