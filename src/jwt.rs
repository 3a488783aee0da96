//! JWT token generation and validation.
//!
//! Access and refresh tokens are signed with separate secrets so a leak of
//! one key cannot be used to mint the other class of token.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived access token, never persisted
    Access,
    /// Long-lived refresh token, tracked on the user record
    Refresh,
}

/// JWT claims for access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user UUID)
    pub sub: String,
    pub username: String,
    pub email: String,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT claims for refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// JWT ID, makes every refresh token unique even within the same second
    pub jti: String,
    /// Subject (user UUID)
    pub sub: String,
    pub username: String,
    pub email: String,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    pub iat: u64,
    pub exp: u64,
}

/// Default access token duration: 15 minutes
pub const ACCESS_TOKEN_DURATION_SECS: u64 = 15 * 60;

/// Default refresh token duration: 10 days
pub const REFRESH_TOKEN_DURATION_SECS: u64 = 10 * 24 * 60 * 60;

/// Identity embedded into both token classes.
#[derive(Debug, Clone, Copy)]
pub struct TokenSubject<'a> {
    pub uuid: &'a str,
    pub username: &'a str,
    pub email: &'a str,
}

#[derive(Clone)]
struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKeys {
    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

/// Configuration for JWT operations.
#[derive(Clone)]
pub struct JwtConfig {
    access: SigningKeys,
    refresh: SigningKeys,
    access_duration: u64,
    refresh_duration: u64,
}

/// Result of generating an access token.
#[derive(Debug, Clone)]
pub struct AccessTokenResult {
    pub token: String,
    /// Token duration in seconds
    pub duration: u64,
}

/// Result of generating a refresh token.
#[derive(Debug, Clone)]
pub struct RefreshTokenResult {
    pub token: String,
    pub jti: String,
    pub issued_at: u64,
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

impl JwtConfig {
    /// Create a JWT configuration with one secret per token class and the
    /// default lifetimes.
    pub fn new(access_secret: &[u8], refresh_secret: &[u8]) -> Self {
        Self {
            access: SigningKeys::from_secret(access_secret),
            refresh: SigningKeys::from_secret(refresh_secret),
            access_duration: ACCESS_TOKEN_DURATION_SECS,
            refresh_duration: REFRESH_TOKEN_DURATION_SECS,
        }
    }

    /// Override the token lifetimes (seconds).
    pub fn with_durations(mut self, access_secs: u64, refresh_secs: u64) -> Self {
        self.access_duration = access_secs;
        self.refresh_duration = refresh_secs;
        self
    }

    /// Generate a stateless access token for a user.
    pub fn generate_access_token(
        &self,
        subject: TokenSubject<'_>,
    ) -> Result<AccessTokenResult, JwtError> {
        let now = unix_now()?;

        let claims = AccessClaims {
            sub: subject.uuid.to_string(),
            username: subject.username.to_string(),
            email: subject.email.to_string(),
            token_type: TokenType::Access,
            iat: now,
            exp: expiry(now, self.access_duration)?,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.access.encoding)
            .map_err(JwtError::Encoding)?;

        Ok(AccessTokenResult {
            token,
            duration: self.access_duration,
        })
    }

    /// Generate a refresh token for a user.
    pub fn generate_refresh_token(
        &self,
        subject: TokenSubject<'_>,
    ) -> Result<RefreshTokenResult, JwtError> {
        let now = unix_now()?;

        let jti = uuid::Uuid::new_v4().to_string();
        let exp = expiry(now, self.refresh_duration)?;

        let claims = RefreshClaims {
            jti: jti.clone(),
            sub: subject.uuid.to_string(),
            username: subject.username.to_string(),
            email: subject.email.to_string(),
            token_type: TokenType::Refresh,
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.refresh.encoding)
            .map_err(JwtError::Encoding)?;

        Ok(RefreshTokenResult {
            token,
            jti,
            issued_at: now,
            expires_at: exp,
            duration: self.refresh_duration,
        })
    }

    /// Validate and decode an access token.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, JwtError> {
        let token_data = jsonwebtoken::decode::<AccessClaims>(
            token,
            &self.access.decoding,
            &strict_validation(),
        )
        .map_err(JwtError::Decoding)?;

        let claims = token_data.claims;
        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }
        ensure_not_expired(claims.exp)?;

        Ok(claims)
    }

    /// Validate and decode a refresh token. Does not check revocation.
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, JwtError> {
        let token_data = jsonwebtoken::decode::<RefreshClaims>(
            token,
            &self.refresh.decoding,
            &strict_validation(),
        )
        .map_err(JwtError::Decoding)?;

        let claims = token_data.claims;
        if claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongTokenType);
        }
        ensure_not_expired(claims.exp)?;

        Ok(claims)
    }
}

fn strict_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation
}

fn unix_now() -> Result<u64, JwtError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| JwtError::TimeError)
}

fn expiry(now: u64, lifetime: u64) -> Result<u64, JwtError> {
    now.checked_add(lifetime).ok_or(JwtError::LifetimeOverflow)
}

// jsonwebtoken accepts exp == now; a zero-lifetime token must not verify.
fn ensure_not_expired(exp: u64) -> Result<(), JwtError> {
    if exp <= unix_now()? {
        return Err(JwtError::Expired);
    }
    Ok(())
}

/// Errors that can occur during JWT operations.
#[derive(Debug)]
pub enum JwtError {
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// Bad signature, malformed structure or expired per the library check
    Decoding(jsonwebtoken::errors::Error),
    /// Token lifetime has elapsed
    Expired,
    /// System time error
    TimeError,
    /// Wrong token type (e.g., using refresh token as access token)
    WrongTokenType,
    /// Configured lifetime pushes the expiry past the representable range
    LifetimeOverflow,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            JwtError::Decoding(e) => write!(f, "Failed to decode token: {}", e),
            JwtError::Expired => write!(f, "Token expired"),
            JwtError::TimeError => write!(f, "System time error"),
            JwtError::WrongTokenType => write!(f, "Wrong token type"),
            JwtError::LifetimeOverflow => write!(f, "Token lifetime out of range"),
        }
    }
}

impl std::error::Error for JwtError {}
