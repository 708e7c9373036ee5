//! Request-path error taxonomy shared by both gateways.
//!
//! Workers and the supervisor report structured errors upward; this module is
//! where they become HTTP responses. Streaming handlers instead serialize
//! `payload()` into a single SSE event before terminating the stream.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Configuration(String),

    #[error("concurrent runner limit reached")]
    CapacityExceeded,

    #[error("{message}")]
    StartupFailed { message: String, output: Vec<String> },

    #[error("error communicating with runner: {0}")]
    Upstream(String),

    #[error("timeout processing request: {0}")]
    UpstreamTimeout(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire identifier carried in the `error.type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::CapacityExceeded => "runner_startup_error",
            GatewayError::StartupFailed { .. } => "runner_startup_error",
            GatewayError::Upstream(_) => "runner_communication_error",
            GatewayError::UpstreamTimeout(_) => "request_timeout_error",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Unauthorized => "auth_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::StartupFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body in the OpenAI error envelope. Startup failures attach the
    /// tail of the worker's output ring as diagnostic context.
    pub fn payload(&self) -> Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let GatewayError::StartupFailed { output, .. } = self {
            if !output.is_empty() {
                error["output"] = json!(output);
            }
        }
        json!({ "error": error })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout(err.to_string())
        } else {
            GatewayError::Upstream(err.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.payload())).into_response()
    }
}
