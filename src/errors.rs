//! Error types shared across the application.
//!
//! Every failure a peer can observe maps onto one [`AppError`] variant, and
//! each variant knows its JSON-RPC error code and the HTTP status used when
//! the failure is reported by the network channel before dispatch.

use std::fmt::{Display, Formatter};

use axum::http::StatusCode;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// JSON-RPC code for a payload that is not valid JSON.
pub const PARSE_ERROR: i64 = -32_700;
/// JSON-RPC code for a structurally invalid envelope.
pub const INVALID_REQUEST: i64 = -32_600;
/// JSON-RPC code for an unknown method or tool.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// JSON-RPC code for parameters that do not match the expected shape.
pub const INVALID_PARAMS: i64 = -32_602;
/// JSON-RPC code for an unexpected server fault.
pub const INTERNAL_ERROR: i64 = -32_603;
/// Declared protocol revision is not supported.
pub const UNSUPPORTED_VERSION: i64 = -32_001;
/// Request came from a non-allowed browser origin.
pub const UNAUTHORIZED_ORIGIN: i64 = -32_002;
/// Session identifier is missing, unknown, or expired.
pub const UNKNOWN_SESSION: i64 = -32_003;
/// Requested replay point has been evicted from the event log.
pub const RESUMPTION_GAP: i64 = -32_004;
/// Worker pool or admission queue is full.
pub const CAPACITY_EXCEEDED: i64 = -32_005;
/// Tool logic failed while serving the request.
pub const UPSTREAM_FAILURE: i64 = -32_006;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Payload is not valid JSON.
    Parse(String),
    /// JSON is valid but the envelope violates JSON-RPC framing rules.
    InvalidRequest(String),
    /// Declared protocol revision is not in the supported set.
    UnsupportedVersion(String),
    /// `Origin` header did not match the loopback allow-list.
    UnauthorizedOrigin(String),
    /// A session header was required but not supplied.
    SessionRequired(String),
    /// Session identifier is unknown or has expired.
    UnknownSession(String),
    /// Method or tool name is not registered.
    UnknownMethod(String),
    /// Parameters failed typed validation.
    InvalidParams(String),
    /// Replay requested from before the oldest retained event.
    ResumptionGap {
        /// Last sequence number the peer reported seeing.
        last_seen: u64,
        /// Oldest sequence number still retained.
        oldest: u64,
    },
    /// Worker pool queue or admission capacity exhausted.
    CapacityExceeded(String),
    /// A tool raised a domain failure.
    Upstream(String),
    /// Work was cancelled before it completed.
    Cancelled(String),
    /// File system path failed validation against the data root.
    PathViolation(String),
    /// Unexpected internal fault.
    Internal(String),
}

impl AppError {
    /// JSON-RPC error code reported to the peer.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::UnsupportedVersion(_) => UNSUPPORTED_VERSION,
            Self::UnauthorizedOrigin(_) => UNAUTHORIZED_ORIGIN,
            Self::SessionRequired(_) | Self::UnknownSession(_) => UNKNOWN_SESSION,
            Self::UnknownMethod(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::PathViolation(_) => INVALID_PARAMS,
            Self::ResumptionGap { .. } => RESUMPTION_GAP,
            Self::CapacityExceeded(_) => CAPACITY_EXCEEDED,
            Self::Upstream(_) | Self::Io(_) | Self::Cancelled(_) => UPSTREAM_FAILURE,
            Self::Config(_) | Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// HTTP status used when the network channel reports this failure.
    ///
    /// Method and parameter failures travel as a JSON-RPC error body on a
    /// `200` response; transport gates map to their own status codes.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Parse(_)
            | Self::InvalidRequest(_)
            | Self::UnsupportedVersion(_)
            | Self::SessionRequired(_) => StatusCode::BAD_REQUEST,
            Self::UnauthorizedOrigin(_) => StatusCode::FORBIDDEN,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::ResumptionGap { .. } => StatusCode::GONE,
            Self::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownMethod(_)
            | Self::InvalidParams(_)
            | Self::PathViolation(_)
            | Self::Upstream(_)
            | Self::Io(_)
            | Self::Cancelled(_) => StatusCode::OK,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure was raised by a transport validation gate
    /// rather than by tool logic.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::InvalidRequest(_)
                | Self::UnsupportedVersion(_)
                | Self::UnauthorizedOrigin(_)
                | Self::SessionRequired(_)
                | Self::UnknownSession(_)
                | Self::UnknownMethod(_)
                | Self::InvalidParams(_)
                | Self::PathViolation(_)
                | Self::ResumptionGap { .. }
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::UnsupportedVersion(msg) => write!(f, "unsupported protocol version: {msg}"),
            Self::UnauthorizedOrigin(msg) => write!(f, "unauthorized origin: {msg}"),
            Self::SessionRequired(msg) => write!(f, "session required: {msg}"),
            Self::UnknownSession(msg) => write!(f, "unknown session: {msg}"),
            Self::UnknownMethod(msg) => write!(f, "unknown method: {msg}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::ResumptionGap { last_seen, oldest } => write!(
                f,
                "resumption gap: event {} is no longer retained (oldest is {oldest})",
                last_seen + 1
            ),
            Self::CapacityExceeded(msg) => write!(f, "capacity exceeded: {msg}"),
            Self::Upstream(msg) => write!(f, "upstream failure: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}
