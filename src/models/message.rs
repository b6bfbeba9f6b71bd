//! JSON-RPC 2.0 envelope model.
//!
//! Inbound bytes are classified into exactly one [`Message`] or rejected
//! with a [`ParseFailure`] that still carries the request id when one could
//! be salvaged, so the peer can correlate the error response.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::AppError;

/// Correlation identifier carried by requests and their responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    Text(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

/// A call that expects exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id echoed on the response.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters (object or array).
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Option<Value>,
}

impl Notification {
    /// Build a notification with the given parameters.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params: Some(params),
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from("2.0"));
        obj.insert("method".into(), Value::from(self.method.clone()));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }
}

/// JSON-RPC error member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&AppError> for ErrorObject {
    fn from(err: &AppError) -> Self {
        let data = match err {
            AppError::ResumptionGap { last_seen, oldest } => {
                Some(json!({ "lastSeen": last_seen, "oldestRetained": oldest }))
            }
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            data,
        }
    }
}

/// Outcome carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful result.
    Result(Value),
    /// Failure.
    Error(ErrorObject),
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echoed request id; `None` serializes as `null` when the id could not
    /// be recovered from a malformed request.
    pub id: Option<RequestId>,
    /// Result or error.
    pub outcome: Outcome,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Outcome::Result(result),
        }
    }

    /// Error response built from an [`AppError`].
    #[must_use]
    pub fn failure(id: Option<RequestId>, err: &AppError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(ErrorObject::from(err)),
        }
    }

    /// Wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let id = self
            .id
            .as_ref()
            .map_or(Value::Null, |id| serde_json::to_value(id).unwrap_or(Value::Null));
        match &self.outcome {
            Outcome::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Outcome::Error(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        }
    }
}

/// Any inbound or outbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call expecting a response.
    Request(Request),
    /// One-way message.
    Notification(Notification),
    /// Answer to a server-initiated request.
    Response(Response),
}

/// Rejection produced while classifying raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// Request id, when the envelope was readable enough to carry one.
    pub id: Option<RequestId>,
    /// Typed cause.
    pub error: AppError,
}

impl ParseFailure {
    fn new(id: Option<RequestId>, error: AppError) -> Self {
        Self { id, error }
    }
}

impl Message {
    /// Classify one serialized message.
    ///
    /// # Errors
    ///
    /// - `AppError::Parse` when the bytes are not JSON.
    /// - `AppError::InvalidRequest` when the JSON is not a single JSON-RPC
    ///   2.0 object with a coherent combination of members.
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, ParseFailure> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ParseFailure::new(None, AppError::Parse(e.to_string())))?;
        Self::from_value(value)
    }

    /// Classify an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`Message::parse`], minus the JSON syntax check.
    pub fn from_value(value: Value) -> std::result::Result<Self, ParseFailure> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            Value::Array(_) => {
                return Err(ParseFailure::new(
                    None,
                    AppError::InvalidRequest("batch messages are not supported".into()),
                ));
            }
            _ => {
                return Err(ParseFailure::new(
                    None,
                    AppError::InvalidRequest("message must be a JSON object".into()),
                ));
            }
        };

        let raw_id = obj.remove("id");
        let id = raw_id.as_ref().and_then(RequestId::from_value);
        let invalid = |msg: &str| ParseFailure::new(id.clone(), AppError::InvalidRequest(msg.into()));

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == "2.0" => {}
            _ => return Err(invalid("jsonrpc member must be \"2.0\"")),
        }

        let null_id = matches!(raw_id, Some(Value::Null));
        if raw_id.is_some() && !null_id && id.is_none() {
            return Err(invalid("id must be a string or an integer"));
        }

        let params = obj.remove("params");
        if let Some(p) = &params {
            if !(p.is_object() || p.is_array()) {
                return Err(invalid("params must be an object or an array"));
            }
        }

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(invalid("method must be a string"));
            };
            if null_id {
                return Err(invalid("request id must not be null"));
            }
            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        let result = obj.remove("result");
        let error = obj.remove("error");
        let outcome = match (result, error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => {
                let error: ErrorObject = serde_json::from_value(error)
                    .map_err(|e| invalid(&format!("malformed error member: {e}")))?;
                Outcome::Error(error)
            }
            (Some(_), Some(_)) => return Err(invalid("result and error are mutually exclusive")),
            (None, None) => return Err(invalid("message has neither method nor result")),
        };
        if raw_id.is_none() {
            return Err(invalid("response must carry an id"));
        }
        Ok(Self::Response(Response { id, outcome }))
    }
}
