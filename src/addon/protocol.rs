//! Add-on wire protocol.
//!
//! One JSON object per line in each direction. The host writes a request,
//! the add-on answers with exactly one response carrying the same id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::AddonError;

/// Liveness probe. Result: `{"pong": true}`.
pub const METHOD_PING: &str = "ping";

/// Lists the add-on's commands. Result: `{"commands": [...]}`.
pub const METHOD_GET_COMMANDS: &str = "generic.getCommands";

/// Runs one command. Params: `{"id": "<command id>"}`.
pub const METHOD_RUN_COMMAND: &str = "generic.runCommand";

/// JSON-RPC style error codes used by the reference add-on.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Request sent to an add-on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, echoed by the response.
    pub id: String,
    /// Method name (e.g., "generic.runCommand").
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Creates a request with a fresh correlation id.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Response returned by an add-on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id of the request being answered.
    pub id: String,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// Error object inside a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
}

impl RpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: String, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(id: String, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Parses one response line and validates it against the request id.
pub fn parse_response(line: &str, expected_id: &str) -> Result<Value, AddonError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(AddonError::Protocol("empty response line".to_string()));
    }

    let response: RpcResponse = serde_json::from_str(trimmed)
        .map_err(|e| AddonError::Protocol(format!("malformed response: {}", e)))?;

    if response.id != expected_id {
        return Err(AddonError::IdMismatch {
            expected: expected_id.to_string(),
            actual: response.id,
        });
    }

    if let Some(error) = response.error {
        return Err(AddonError::Remote {
            code: error.code,
            message: error.message,
        });
    }

    Ok(response.result.unwrap_or(Value::Null))
}

/// A command exposed through `generic.getCommands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonCommand {
    /// Command id passed back to `generic.runCommand`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
}

/// Result of `generic.getCommands`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandList {
    /// Commands, in the add-on's order.
    #[serde(default)]
    pub commands: Vec<AddonCommand>,
}

/// Parameters for `generic.runCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandParams {
    /// Command id.
    pub id: String,
}
