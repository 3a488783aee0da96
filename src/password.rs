//! Password hashing.
//!
//! Argon2id is deliberately expensive, so hashing runs on the blocking pool
//! and the number of in-flight hashes is capped by a semaphore.

use argon2::{
    Algorithm, Argon2, ParamsBuilder, PasswordHash, PasswordHasher as _, PasswordVerifier,
    Version, password_hash::SaltString,
};
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::Semaphore;

const SALT_LEN: usize = 16;

/// Argon2 cost parameters and concurrency cap.
#[derive(Debug, Clone)]
pub struct HashingConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    /// Maximum number of hash/verify operations running at once
    pub max_concurrent: usize,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024, // 19 MiB
            iterations: 2,
            max_concurrent: 4,
        }
    }
}

#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    permits: Arc<Semaphore>,
}

impl PasswordHasher {
    pub fn new(config: &HashingConfig) -> Result<Self, PasswordError> {
        let mut builder = ParamsBuilder::new();
        builder.m_cost(config.memory_kib);
        builder.t_cost(config.iterations);
        builder.p_cost(1);
        let params = builder
            .build()
            .map_err(|e| PasswordError::Params(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        Ok(Self {
            argon2,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        })
    }

    /// Hash a plaintext password into a PHC string.
    pub async fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        self.run_blocking(move || hash_blocking(&argon2, &password))
            .await
    }

    /// Check a plaintext password against a stored PHC string.
    /// Returns `Ok(false)` on mismatch; errors only on malformed hashes.
    pub async fn verify(&self, password: &str, encoded: &str) -> Result<bool, PasswordError> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        let encoded = encoded.to_owned();
        self.run_blocking(move || verify_blocking(&argon2, &password, &encoded))
            .await
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T, PasswordError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, PasswordError> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PasswordError::PoolClosed)?;
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|_| PasswordError::PoolClosed)?
    }
}

fn hash_blocking(argon2: &Argon2<'_>, password: &str) -> Result<String, PasswordError> {
    let mut salt_bytes = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt_bytes);
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|e| PasswordError::Hash(e.to_string()))?;
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::Hash(e.to_string()))?
        .to_string();
    Ok(hash)
}

fn verify_blocking(
    argon2: &Argon2<'_>,
    password: &str,
    encoded: &str,
) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(encoded).map_err(|e| PasswordError::Hash(e.to_string()))?;
    match argon2.verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::Hash(e.to_string())),
    }
}

#[derive(Debug)]
pub enum PasswordError {
    /// Invalid Argon2 cost parameters
    Params(String),
    /// Hashing or hash parsing failed
    Hash(String),
    /// The blocking task could not be scheduled or panicked
    PoolClosed,
}

impl std::fmt::Display for PasswordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordError::Params(e) => write!(f, "Invalid hashing parameters: {}", e),
            PasswordError::Hash(e) => write!(f, "Password hashing error: {}", e),
            PasswordError::PoolClosed => write!(f, "Hashing pool unavailable"),
        }
    }
}

impl std::error::Error for PasswordError {}
