//! Supervisor error taxonomy and its JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors returned synchronously by lifecycle operations.
///
/// All of these are scoped to a single instance and leave every other
/// instance untouched.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),

    #[error("instance '{0}' is not running")]
    NotRunning(String),

    #[error("failed to spawn instance '{instance_id}': {reason}")]
    SpawnError { instance_id: String, reason: String },

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance '{instance_id}' did not exit within {waited_ms}ms of being stopped")]
    StopTimeout { instance_id: String, waited_ms: u64 },
}

impl SupervisorError {
    pub fn spawn(instance_id: &str, reason: impl ToString) -> Self {
        SupervisorError::SpawnError {
            instance_id: instance_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            SupervisorError::NotRunning(_) => ErrorCode::NotRunning,
            SupervisorError::SpawnError { .. } => ErrorCode::SpawnFailed,
            SupervisorError::NotFound(_) => ErrorCode::NotFound,
            SupervisorError::StopTimeout { .. } => ErrorCode::StopTimeout,
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Start requested for an instance with a live process
    AlreadyRunning,
    /// Stop requested for an instance without a live process
    NotRunning,
    /// The OS refused to create the process
    SpawnFailed,
    /// Unknown instance id
    NotFound,
    /// Restart gave up waiting for the old process to exit
    StopTimeout,
    /// Malformed request
    BadRequest,
    /// Missing or wrong admin token
    Unauthorized,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::NotRunning => StatusCode::CONFLICT,
            ErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::StopTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Get the error code as a string for the X-Supervisor-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::StopTimeout => "STOP_TIMEOUT",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Supervisor-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Supervisor-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&SupervisorError> for Response<Full<Bytes>> {
    fn from(err: &SupervisorError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
