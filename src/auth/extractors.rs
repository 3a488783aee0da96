//! Axum extractors for the access gate.
//!
//! `Auth` rejects the request on any failure. `OptionalAuth` runs the same
//! checks but resolves to `None` instead, for endpoints that personalize
//! output yet must also serve anonymous viewers.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::cookie::access_token;
use super::errors::{ApiAuthError, AuthErrorKind};
use super::state::HasAuthBackend;
use super::types::AuthenticatedUser;

/// Core access token check shared by both extractors.
async fn authenticate_request<S>(
    parts: &Parts,
    state: &S,
) -> Result<AuthenticatedUser, AuthErrorKind>
where
    S: HasAuthBackend + Send + Sync,
{
    let token = access_token(&parts.headers).ok_or(AuthErrorKind::MissingToken)?;
    let sessions = state.sessions();

    let claims = sessions
        .jwt()
        .validate_access_token(token)
        .map_err(|_| AuthErrorKind::InvalidToken)?;

    let user = sessions
        .resolve_user(&claims.sub)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to get user");
            AuthErrorKind::DatabaseError
        })?
        .ok_or(AuthErrorKind::UserNotFound)?;

    Ok(AuthenticatedUser { user, claims })
}

/// Extractor for endpoints that require authentication.
pub struct Auth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate_request(parts, state)
            .await
            .map(Auth)
            .map_err(ApiAuthError::from)
    }
}

/// Optional authentication extractor. Never fails; any failure yields `None`.
pub struct OptionalAuth(pub Option<AuthenticatedUser>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalAuth(authenticate_request(parts, state).await.ok()))
    }
}
