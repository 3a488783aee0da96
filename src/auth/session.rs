//! Session lifecycle: credential checks, token issuance and refresh rotation.
//!
//! Each user has at most one live refresh token. A successful refresh
//! replaces it; presenting any other refresh token (stale, replayed or
//! foreign) clears the session and forces a full login.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::db::{Database, User};
use crate::jwt::{JwtConfig, JwtError, TokenSubject};
use crate::password::{PasswordError, PasswordHasher};

/// Number of lock stripes guarding per-user rotation.
const LOCK_STRIPES: usize = 64;

/// Freshly issued access/refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub access_expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

/// A user together with the tokens just issued to them.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    pub tokens: TokenPair,
}

pub struct SessionManager {
    db: Database,
    jwt: Arc<JwtConfig>,
    passwords: PasswordHasher,
    store_timeout: Duration,
    locks: Vec<Mutex<()>>,
}

impl SessionManager {
    pub fn new(
        db: Database,
        jwt: Arc<JwtConfig>,
        passwords: PasswordHasher,
        store_timeout: Duration,
    ) -> Self {
        Self {
            db,
            jwt,
            passwords,
            store_timeout,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn passwords(&self) -> &PasswordHasher {
        &self.passwords
    }

    pub fn jwt(&self) -> &JwtConfig {
        &self.jwt
    }

    /// Look up the user a token was issued to. The account may have been
    /// deleted since.
    pub async fn resolve_user(&self, uuid: &str) -> Result<Option<User>, SessionError> {
        self.bounded(self.db.users().get_by_uuid(uuid)).await
    }

    /// Check a login handle (username or email) and password.
    ///
    /// Fails with `MissingCredentials` if no handle or no password was given,
    /// `UserNotFound` if no user matches, and `InvalidPassword` on mismatch.
    pub async fn verify_credentials(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        password: &str,
    ) -> Result<User, SessionError> {
        let username = non_empty(username).map(str::to_lowercase);
        let email = non_empty(email);

        if (username.is_none() && email.is_none()) || password.is_empty() {
            return Err(SessionError::MissingCredentials);
        }

        let credentials = self
            .bounded(self.db.users().get_credentials(username.as_deref(), email))
            .await?
            .ok_or(SessionError::UserNotFound)?;

        let matches = self
            .passwords
            .verify(password, &credentials.password_hash)
            .await
            .map_err(SessionError::Password)?;

        if !matches {
            return Err(SessionError::InvalidPassword);
        }

        Ok(credentials.user)
    }

    /// Mint a new access/refresh pair for a user. Pure; nothing is persisted.
    pub fn issue_tokens(&self, user: &User) -> Result<TokenPair, SessionError> {
        let subject = TokenSubject {
            uuid: &user.uuid,
            username: &user.username,
            email: &user.email,
        };
        let access = self
            .jwt
            .generate_access_token(subject)
            .map_err(SessionError::Token)?;
        let refresh = self
            .jwt
            .generate_refresh_token(subject)
            .map_err(SessionError::Token)?;

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            access_expires_in: access.duration,
            refresh_expires_in: refresh.duration,
        })
    }

    /// Verify credentials, issue a pair and make its refresh token the only
    /// live one for the user. Any earlier session loses its refresh ability.
    pub async fn login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        password: &str,
    ) -> Result<Session, SessionError> {
        let user = self.verify_credentials(username, email, password).await?;
        let tokens = self.issue_tokens(&user)?;

        {
            let _guard = self.lock_user(user.id).await;
            self.bounded(self.db.sessions().persist(user.id, &tokens.refresh_token))
                .await?;
        }

        info!(user = %user.uuid, "User logged in");
        Ok(Session { user, tokens })
    }

    /// Exchange the presented refresh token for a new pair.
    ///
    /// The check-and-replace runs under the user's lock and the write is
    /// conditional on the stored value, so of two concurrent calls with the
    /// same token at most one succeeds.
    pub async fn rotate(&self, presented: &str) -> Result<Session, SessionError> {
        let claims = self
            .jwt
            .validate_refresh_token(presented)
            .map_err(|_| SessionError::InvalidRefreshToken)?;

        let user = self
            .resolve_user(&claims.sub)
            .await?
            .ok_or(SessionError::InvalidRefreshToken)?;

        let _guard = self.lock_user(user.id).await;

        let is_current = self
            .bounded(self.db.sessions().is_current(user.id, presented))
            .await?;
        if !is_current {
            return Err(self.revoke_after_reuse(&user).await);
        }

        let tokens = self.issue_tokens(&user)?;
        let replaced = self
            .bounded(
                self.db
                    .sessions()
                    .replace_if_current(user.id, presented, &tokens.refresh_token),
            )
            .await?;
        if !replaced {
            return Err(self.revoke_after_reuse(&user).await);
        }

        Ok(Session { user, tokens })
    }

    /// Clear the user's refresh token.
    pub async fn logout(&self, user: &User) -> Result<(), SessionError> {
        let _guard = self.lock_user(user.id).await;
        self.bounded(self.db.sessions().clear(user.id)).await?;
        info!(user = %user.uuid, "User logged out");
        Ok(())
    }

    /// Replace a user's password after checking the old one.
    /// The live session is left untouched.
    pub async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), SessionError> {
        let stored = self
            .bounded(self.db.users().get_password_hash(user.id))
            .await?
            .ok_or(SessionError::UserNotFound)?;

        let matches = self
            .passwords
            .verify(old_password, &stored)
            .await
            .map_err(SessionError::Password)?;
        if !matches {
            return Err(SessionError::InvalidPassword);
        }

        let hash = self
            .passwords
            .hash(new_password)
            .await
            .map_err(SessionError::Password)?;
        self.bounded(self.db.users().set_password_hash(user.id, &hash))
            .await?;

        info!(user = %user.uuid, "Password changed");
        Ok(())
    }

    async fn revoke_after_reuse(&self, user: &User) -> SessionError {
        warn!(user = %user.uuid, "Stale or reused refresh token presented, clearing session");
        match self.bounded(self.db.sessions().clear(user.id)).await {
            Ok(_) => SessionError::RefreshTokenReused,
            Err(e) => e,
        }
    }

    async fn lock_user(&self, user_id: i64) -> MutexGuard<'_, ()> {
        let stripe = user_id.unsigned_abs() as usize % self.locks.len();
        self.locks[stripe].lock().await
    }

    /// Bound a persistence call by the configured store timeout.
    pub async fn bounded<T, F>(&self, operation: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => result.map_err(SessionError::Database),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug)]
pub enum SessionError {
    /// No login handle or no password supplied
    MissingCredentials,
    /// No user matches the login handle
    UserNotFound,
    InvalidPassword,
    /// Bad signature, malformed, expired, or its user no longer exists
    InvalidRefreshToken,
    /// Token is not the user's current one; the session has been cleared
    RefreshTokenReused,
    /// The store did not answer within the configured timeout
    Timeout,
    Database(sqlx::Error),
    Password(PasswordError),
    Token(JwtError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MissingCredentials => write!(f, "Username or email and password are required"),
            SessionError::UserNotFound => write!(f, "User does not exist"),
            SessionError::InvalidPassword => write!(f, "Invalid user credentials"),
            SessionError::InvalidRefreshToken => write!(f, "Invalid refresh token"),
            SessionError::RefreshTokenReused => {
                write!(f, "Refresh token is expired or used, login required")
            }
            SessionError::Timeout => write!(f, "Session store timed out"),
            SessionError::Database(e) => write!(f, "Session store error: {}", e),
            SessionError::Password(e) => write!(f, "{}", e),
            SessionError::Token(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}
