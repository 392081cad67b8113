use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { status: u16, url: String },

    #[error("Malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Unknown category {category:?} for entry {uid:?}")]
    UnknownCategory { uid: String, category: String },

    #[error("Entry {uid:?} has category {category:?}, not expected at depth {depth}")]
    UnexpectedCategory {
        uid: String,
        category: String,
        depth: usize,
    },

    #[error("No entry at {path:?} in the current report")]
    PathNotFound { path: Vec<String> },

    #[error("Unsupported entry depth {0}")]
    UnsupportedDepth(usize),

    #[error("{0}")]
    Application(String),

    #[error("Cannot {0} while another control operation is in progress")]
    Busy(&'static str),

    #[error("No report has been fetched yet")]
    NoReport,

    #[error("Session has ended")]
    SessionEnded,

    #[error("Invalid base URL {0:?}")]
    InvalidBaseUrl(String),
}

/// Error classes as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Network or HTTP failure; polling retries with back-off.
    Transport,
    /// Client and server disagree about the report's shape.
    Protocol,
    /// Server-side `errmsg` carried by a successful response.
    Application,
    /// Rejected locally by the engine's own state.
    Control,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Http(_) | SyncError::Status { .. } => ErrorKind::Transport,
            SyncError::Decode { .. }
            | SyncError::UnknownCategory { .. }
            | SyncError::UnexpectedCategory { .. }
            | SyncError::PathNotFound { .. }
            | SyncError::UnsupportedDepth(_) => ErrorKind::Protocol,
            SyncError::Application(_) => ErrorKind::Application,
            SyncError::Busy(_)
            | SyncError::NoReport
            | SyncError::SessionEnded
            | SyncError::InvalidBaseUrl(_) => ErrorKind::Control,
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::PathNotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::Busy(_) | SyncError::SessionEnded => StatusCode::CONFLICT,
            SyncError::NoReport => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Application(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_GATEWAY,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_is_transport() {
        let err = SyncError::Status {
            status: 503,
            url: "http://localhost/report".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_structural_errors_are_protocol() {
        let drift = SyncError::PathNotFound {
            path: vec!["root".to_string(), "T1".to_string()],
        };
        let category = SyncError::UnknownCategory {
            uid: "C1".to_string(),
            category: "assertion".to_string(),
        };
        assert_eq!(drift.kind(), ErrorKind::Protocol);
        assert_eq!(category.kind(), ErrorKind::Protocol);
        assert_eq!(SyncError::UnsupportedDepth(7).kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_application_message_is_displayed_verbatim() {
        let err = SyncError::Application("Cannot run while resetting".to_string());
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.to_string(), "Cannot run while resetting");
    }

    #[test]
    fn test_response_status_mapping() {
        let resp = SyncError::Busy("reset").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = SyncError::Application("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = SyncError::NoReport.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
