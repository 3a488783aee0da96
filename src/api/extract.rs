//! Request extractors whose rejections use the API error envelope.

use axum::extract::{FromRequest, FromRequestParts, Json, Query, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::ApiError;

/// JSON body extractor. Malformed bodies and wrong content types are
/// rejected with a 400 instead of axum's plain-text response.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
            debug!(error = %e, "Rejected JSON body");
            ApiError::bad_request(e.body_text())
        })?;
        Ok(ApiJson(value))
    }
}

/// Query string extractor with the same rejection handling.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                debug!(error = %e, "Rejected query string");
                ApiError::bad_request(e.body_text())
            })?;
        Ok(ApiQuery(value))
    }
}
