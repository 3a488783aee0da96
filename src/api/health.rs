use axum::{Router, routing::get};

use super::response::ApiResponse;

pub fn router() -> Router {
    Router::new().route("/", get(healthcheck))
}

async fn healthcheck() -> ApiResponse<&'static str> {
    ApiResponse::ok("OK", "success")
}
