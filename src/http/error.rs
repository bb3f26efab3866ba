//! HTTP mapping for flow errors.
//!
//! Bodies only ever carry the error category. Detail goes to the log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::directory::StarError;
use crate::saml::AuthError;

pub(crate) fn error_body(status: StatusCode, category: &str) -> Response {
    (status, Json(json!({ "error": category }))).into_response()
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Validation(ref e) => error_body(StatusCode::UNAUTHORIZED, e.category()),
            AuthError::Configuration(_) | AuthError::Provisioning(_) | AuthError::Storage(_) => {
                error!(error = %self, "Authentication internal error");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, self.category())
            }
        }
    }
}

impl IntoResponse for StarError {
    fn into_response(self) -> Response {
        match self {
            StarError::UnknownReceiver(_) => error_body(StatusCode::BAD_REQUEST, "unknown_receiver"),
            StarError::SelfStar => error_body(StatusCode::BAD_REQUEST, "self_star"),
            StarError::Storage(e) => {
                error!(error = %e, "Star storage failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage_failed")
            }
        }
    }
}
