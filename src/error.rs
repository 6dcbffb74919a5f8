//! Error taxonomy for the relay.
//!
//! Failures are handled at the smallest scope that can contain them: a
//! listener's write failure never reaches this type, it only unregisters that
//! listener. What remains here is what a request or the process can observe.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The initial GET to the upstream failed; no session was started.
    #[error("upstream {url} unavailable: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    /// The registry refused a new listener (limit reached or ids exhausted).
    #[error("listener registration failed: {0}")]
    RegistrationFailed(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::UpstreamUnavailable { .. } | RelayError::Search(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::RegistrationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Config(_) | RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        let err = RelayError::UpstreamUnavailable {
            url: "http://example.invalid/a.mp3".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "upstream http://example.invalid/a.mp3 unavailable: connection refused"
        );
        assert_eq!(
            RelayError::Search("timeout".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn registration_failure_is_service_unavailable() {
        let err = RelayError::RegistrationFailed("listener limit 4 reached".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn io_errors_convert() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
