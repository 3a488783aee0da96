mod error;
mod extract;
mod health;
mod response;
mod users;

use axum::Router;
use std::sync::Arc;

use crate::auth::SessionManager;
use crate::db::Database;
use crate::media::MediaStore;
use crate::rate_limit::RateLimitConfig;

pub use error::{ApiError, ResultExt};
pub use response::ApiResponse;
pub use users::UsersState;

/// Create the API router.
pub fn create_api_router(
    db: Database,
    sessions: Arc<SessionManager>,
    media: Arc<dyn MediaStore>,
    secure_cookies: bool,
    rate_limit: Option<Arc<RateLimitConfig>>,
) -> Router {
    let users_state = users::UsersState {
        db,
        sessions,
        media,
        secure_cookies,
        rate_limit,
    };

    Router::new()
        .nest("/users", users::router(users_state))
        .nest("/healthcheck", health::router())
}
