//! JSON-RPC 2.0 message shapes and their recognizers.
//!
//! Messages travel as flat JSON objects tagged with `"jsonrpc":"2.0"`:
//!
//! ```text
//! request       {"jsonrpc":"2.0","id":1,"method":"add","params":[23,19]}
//! notification  {"jsonrpc":"2.0","method":"tick","params":[]}
//! success       {"jsonrpc":"2.0","id":1,"result":42}
//! error         {"jsonrpc":"2.0","id":1,"code":-32601,"message":"Method not found","data":"add"}
//! reference     {"jsonrpc":"2.0","method":"#3"}
//! ```
//!
//! Decoding never reflects over arbitrary shapes; [`Message::from_value`]
//! checks discriminants in a fixed order: notification, request, success,
//! error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl Id {
    /// Read an identifier from a JSON value; only integers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Id::Number),
            Value::String(s) => Some(Id::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{}", n),
            Id::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl TryFrom<u64> for Id {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        i64::try_from(value).map(Id::Number)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::String(value.to_string())
    }
}

/// Pre-defined JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

/// A message that violates the wire protocol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { id: Option<Id>, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { id: Option<Id>, message: String },

    #[error("Line exceeds maximum length of {limit} bytes")]
    LineTooLong { limit: usize },
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Parse { .. } => ErrorCode::ParseError,
            ProtocolError::InvalidRequest { .. } | ProtocolError::LineTooLong { .. } => {
                ErrorCode::InvalidRequest
            }
            ProtocolError::InvalidParams { .. } => ErrorCode::InvalidParams,
        }
    }

    /// The offending message's id, when it could be recovered.
    pub fn id(&self) -> Option<&Id> {
        match self {
            ProtocolError::InvalidRequest { id, .. } | ProtocolError::InvalidParams { id, .. } => {
                id.as_ref()
            }
            _ => None,
        }
    }

    /// Error response reporting this violation back to the peer.
    pub fn to_error_message(&self) -> ErrorMessage {
        let code = self.code();
        ErrorMessage::new(
            self.id().cloned(),
            code as i32,
            code.message(),
            Some(Value::String(self.to_string())),
        )
    }
}

/// Notification: a call that expects no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
}

/// Request: a call correlated to its reply by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: Id,
    pub method: String,
    pub params: Vec<Value>,
}

/// Successful reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessMessage {
    pub jsonrpc: String,
    pub id: Id,
    pub result: Value,
}

/// Failed reply to a request, or a report of an unreadable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub jsonrpc: String,
    pub id: Option<Id>,
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl RequestMessage {
    pub fn new(id: Id, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl SuccessMessage {
    pub fn new(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

impl ErrorMessage {
    pub fn new(id: Option<Id>, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            code,
            message: message.into(),
            data,
        }
    }
}

/// Any message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Notification(NotificationMessage),
    Request(RequestMessage),
    Success(SuccessMessage),
    Error(ErrorMessage),
}

impl Message {
    /// Classify a decoded JSON document.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::InvalidRequest {
                id: None,
                message: "message is not a JSON object".to_string(),
            });
        };

        // An id that is neither an integer nor a string counts as absent.
        let id = map.get("id").and_then(Id::from_value);

        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::InvalidRequest {
                id,
                message: "expected jsonrpc 2.0".to_string(),
            });
        }

        let method = match map.remove("method") {
            None => None,
            Some(Value::String(method)) if !method.is_empty() => Some(method),
            Some(_) => {
                return Err(ProtocolError::InvalidRequest {
                    id,
                    message: "method must be a non-empty string".to_string(),
                })
            }
        };

        if let Some(method) = method {
            let params = take_params(&mut map, &id)?;
            return Ok(match id {
                None => Message::Notification(NotificationMessage::new(method, params)),
                Some(id) => Message::Request(RequestMessage::new(id, method, params)),
            });
        }

        let error = take_error(&mut map, &id)?;
        match (id, error) {
            (Some(id), None) => {
                let result = map.remove("result").unwrap_or(Value::Null);
                Ok(Message::Success(SuccessMessage::new(id, result)))
            }
            (id, Some((code, message, data))) => {
                Ok(Message::Error(ErrorMessage::new(id, code, message, data)))
            }
            (None, None) => Err(ProtocolError::InvalidRequest {
                id: None,
                message: "message matches no known shape".to_string(),
            }),
        }
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Notification(_) => None,
            Message::Request(m) => Some(&m.id),
            Message::Success(m) => Some(&m.id),
            Message::Error(m) => m.id.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Notification(_) => "notification",
            Message::Request(_) => "request",
            Message::Success(_) => "success",
            Message::Error(_) => "error",
        }
    }
}

fn take_params(map: &mut Map<String, Value>, id: &Option<Id>) -> Result<Vec<Value>, ProtocolError> {
    match map.remove("params") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(params)) => Ok(params),
        Some(other) => Err(ProtocolError::InvalidParams {
            id: id.clone(),
            message: format!("params must be an array, got {}", json_type(&other)),
        }),
    }
}

/// Flat `code`/`message` fields, or a nested `error` object from peers that
/// use the canonical JSON-RPC layout.
///
/// An integer code outside the `i32` range is rejected rather than truncated.
fn take_error(
    map: &mut Map<String, Value>,
    id: &Option<Id>,
) -> Result<Option<(i32, String, Option<Value>)>, ProtocolError> {
    fn read(
        map: &mut Map<String, Value>,
        id: &Option<Id>,
    ) -> Result<Option<(i32, String, Option<Value>)>, ProtocolError> {
        let (Some(raw), Some(message)) = (
            map.get("code").and_then(Value::as_i64),
            map.get("message").and_then(Value::as_str),
        ) else {
            return Ok(None);
        };
        let code = i32::try_from(raw).map_err(|_| ProtocolError::InvalidRequest {
            id: id.clone(),
            message: format!("error code {} is out of range", raw),
        })?;
        let message = message.to_string();
        Ok(Some((code, message, map.remove("data"))))
    }

    if let Some(found) = read(map, id)? {
        return Ok(Some(found));
    }
    match map.get_mut("error") {
        Some(Value::Object(nested)) => read(nested, id),
        _ => Ok(None),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Wire placeholder standing in for a marshalled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodReference {
    pub method: String,
}

impl MethodReference {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "method": self.method })
    }

    /// Recognize a reference: exactly `jsonrpc` and a non-empty `method`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 2 || map.get("jsonrpc")?.as_str()? != JSONRPC_VERSION {
            return None;
        }
        match map.get("method")?.as_str()? {
            "" => None,
            method => Some(Self::new(method)),
        }
    }
}
