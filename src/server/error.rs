//! The V2 distribution error envelope.
//!
//! Every protocol failure is reported as
//! `{"errors":[{"code":"<CODE>","message":"<msg>"}]}` with the documented
//! HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// A protocol-level registry error.
#[derive(Debug)]
pub(crate) struct RegError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl RegError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// An opaque 500 for failures that have no V2 code.
    pub fn internal(message: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "", message.to_string())
    }
}

#[derive(Serialize)]
struct ErrorEntry {
    code: String,
    message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

impl IntoResponse for RegError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.code.to_owned(),
                message: self.message,
            }],
        };
        (self.status, Json(envelope)).into_response()
    }
}
