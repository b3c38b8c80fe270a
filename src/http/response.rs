//! Response helpers.
//!
//! Errors and administrative results share one JSON envelope:
//! `{ "code": <status>, "message": <text> }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard JSON envelope for non-proxied responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub code: u16,
    pub message: String,
}

pub fn json_message(status: StatusCode, message: impl Into<String>) -> Response {
    let body = Message {
        code: status.as_u16(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}
