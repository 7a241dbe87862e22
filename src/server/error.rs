//! JSON error responses for failures detected before streaming starts.
//!
//! Every pre-stream failure renders as `{"success": false, "error": "<message>"}`.
//! Building the body cannot fail, so a client error never turns into a server fault.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

/// Error returned by HTTP handlers and middleware.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    RateLimited { retry_after: Duration },
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::Validation(_) | PipelineError::VoiceNotFound(_) | PipelineError::Spawn(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::Synthesis(_) | PipelineError::Transcode(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(PipelineError::Cancelled(_) | PipelineError::ClientDisconnect) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Pipeline(err) => err.to_string(),
            ApiError::RateLimited { retry_after } => format!("rate limit exceeded, retry in {}s", retry_after.as_secs().max(1)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::Pipeline(err) if err.is_server_fault() => warn!("❌ Request failed ({}): {}", status, err),
            other => debug!("Request rejected ({}): {}", status, other.message()),
        }

        let body = Json(ErrorBody { success: false, error: self.message() });
        let mut response = (status, body).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::from(PipelineError::Validation("bad".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(PipelineError::VoiceNotFound("x".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(PipelineError::Spawn("missing".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(PipelineError::Synthesis("boom".into())).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::RateLimited { retry_after: Duration::from_secs(3) }.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_body_shape() {
        let response = ApiError::from(PipelineError::VoiceNotFound("tohoku".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("tohoku"));
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited { retry_after: Duration::from_millis(2500) }.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
