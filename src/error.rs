use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialError;
use crate::transform::TransformError;

/// Every way a chat-completion request can fail once it reaches the gateway.
///
/// Only the two `Upstream*` variants are produced by an upstream attempt; the
/// rest abort the request before (or instead of) dispatch.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Model {0} not found")]
    UnknownModel(String),

    #[error("no endpoints configured for model {0}")]
    NoEndpointsAvailable(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("{body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("{0}")]
    UpstreamTransport(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Transform(_) => StatusCode::BAD_REQUEST,
            Self::UnknownModel(_) => StatusCode::NOT_FOUND,
            Self::NoEndpointsAvailable(_)
            | Self::Credential(_)
            | Self::UpstreamTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// True when the error was observed on an upstream attempt.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamHttp { .. } | Self::UpstreamTransport(_)
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        detail_response(self.status(), &self.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailResponse {
    pub detail: String,
}

pub fn detail_response(status: StatusCode, message: &str) -> Response {
    let body = DetailResponse {
        detail: message.to_string(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_http_error_mirrors_status() {
        let err = GatewayError::UpstreamHttp {
            status: 429,
            body: "quota".to_string(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.to_string(), "quota");
    }

    #[test]
    fn upstream_http_error_with_nonsense_status_maps_to_500() {
        let err = GatewayError::UpstreamHttp {
            status: 42,
            body: String::new(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn taxonomy_status_codes() {
        assert_eq!(
            GatewayError::UnknownModel("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoEndpointsAvailable("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Transform(TransformError::Malformed("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UpstreamTransport("reset".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(GatewayError::UpstreamTransport("reset".into()).is_upstream());
        assert!(!GatewayError::UnknownModel("x".into()).is_upstream());
    }
}
