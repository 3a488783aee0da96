//! JWT authentication and session management.
//!
//! Dual-token system: short-lived access tokens (15 min, stateless) and
//! long-lived refresh tokens (10 days, one live token per user in the
//! database). Refreshing rotates the stored token; presenting a stale one
//! ends the session.

mod cookie;
mod errors;
mod extractors;
mod ip;
mod session;
mod state;
mod types;

pub use cookie::{
    ACCESS_COOKIE_NAME, REFRESH_COOKIE_NAME, access_token, bearer_token, clear_cookie,
    get_cookie, session_cookie,
};
pub use errors::{ApiAuthError, AuthErrorKind};
pub use extractors::{Auth, OptionalAuth};
pub use ip::extract_client_ip;
pub use session::{Session, SessionError, SessionManager, TokenPair};
pub use state::HasAuthBackend;
pub use types::AuthenticatedUser;
