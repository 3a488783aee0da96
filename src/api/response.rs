//! Success envelope shared by all endpoints.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// `{"statusCode", "data", "message", "success": true}`
pub struct ApiResponse<T> {
    status: StatusCode,
    data: T,
    message: &'static str,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, message: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            data,
            message,
        }
    }

    pub fn created(data: T, message: &'static str) -> Self {
        Self {
            status: StatusCode::CREATED,
            data,
            message,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a, T> {
    status_code: u16,
    data: &'a T,
    message: &'a str,
    success: bool,
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(Envelope {
                status_code: self.status.as_u16(),
                data: &self.data,
                message: self.message,
                success: true,
            }),
        )
            .into_response()
    }
}
