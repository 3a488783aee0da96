//! Persistence of the single live refresh token per user.
//!
//! Only a digest of the token is stored. Access tokens are never persisted.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;

/// Store for the current refresh token of each user.
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Unconditionally replace the stored refresh token for a user.
    pub async fn persist(&self, user_id: i64, refresh_token: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET refresh_token_hash = ? WHERE id = ?")
            .bind(token_digest(refresh_token))
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the stored token only if it still equals `expected`.
    /// Returns false when another writer rotated or cleared it first.
    pub async fn replace_if_current(
        &self,
        user_id: i64,
        expected: &str,
        refresh_token: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET refresh_token_hash = ? WHERE id = ? AND refresh_token_hash = ?",
        )
        .bind(token_digest(refresh_token))
        .bind(user_id)
        .bind(token_digest(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether `presented` is the user's current refresh token.
    pub async fn is_current(&self, user_id: i64, presented: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT refresh_token_hash FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((Some(stored),)) = row else {
            return Ok(false);
        };
        let candidate = token_digest(presented);
        Ok(constant_time_eq(candidate.as_bytes(), stored.as_bytes()))
    }

    /// Whether the user currently has a live session.
    pub async fn has_session(&self, user_id: i64) -> Result<bool, sqlx::Error> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT refresh_token_hash FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((Some(_),))))
    }

    /// Clear the stored refresh token (logout or reuse detected).
    pub async fn clear(&self, user_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET refresh_token_hash = NULL WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn token_digest(token: &str) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
