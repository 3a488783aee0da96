pub mod api;
pub mod auth;
pub mod cli;
pub mod db;
pub mod jwt;
pub mod media;
pub mod password;
pub mod rate_limit;

use api::create_api_router;
use auth::SessionManager;
use axum::{Router, http::HeaderName};
use db::Database;
use jwt::JwtConfig;
use media::MediaStore;
use password::{HashingConfig, PasswordError, PasswordHasher};
use rate_limit::{PRUNE_INTERVAL, RateLimitConfig, spawn_pruner};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Prefix all API routes are mounted under.
pub const API_PREFIX: &str = "/api/v1";

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// Object storage for avatars and cover images
    pub media: Arc<dyn MediaStore>,
    /// Secret for signing access tokens
    pub access_secret: Vec<u8>,
    /// Secret for signing refresh tokens, distinct from the access secret
    pub refresh_secret: Vec<u8>,
    /// Access token lifetime in seconds
    pub access_token_expiry: u64,
    /// Refresh token lifetime in seconds
    pub refresh_token_expiry: u64,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
    pub hashing: HashingConfig,
    /// Upper bound on each session store call
    pub store_timeout: Duration,
    /// Whether per-IP rate limiting is enabled
    pub rate_limit: bool,
    /// Header carrying the client IP (requires running behind a proxy)
    pub ip_header: Option<HeaderName>,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Result<Router, PasswordError> {
    let jwt = Arc::new(
        JwtConfig::new(&config.access_secret, &config.refresh_secret)
            .with_durations(config.access_token_expiry, config.refresh_token_expiry),
    );
    let passwords = PasswordHasher::new(&config.hashing)?;
    let sessions = Arc::new(SessionManager::new(
        config.db.clone(),
        jwt.clone(),
        passwords,
        config.store_timeout,
    ));

    let rate_limit = config
        .rate_limit
        .then(|| Arc::new(RateLimitConfig::new(config.ip_header.clone())));
    if let Some(limits) = &rate_limit {
        // Spawning needs a runtime; without one the limiters are never pruned
        if tokio::runtime::Handle::try_current().is_ok() {
            spawn_pruner(limits, PRUNE_INTERVAL);
        }
    }

    let api_router = create_api_router(
        config.db.clone(),
        sessions,
        config.media.clone(),
        config.secure_cookies,
        rate_limit,
    );

    Ok(Router::new().nest(API_PREFIX, api_router))
}

/// Run the server on the given listener. This function blocks until the server exits.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config).map_err(std::io::Error::other)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), std::io::Error> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = run_server(config, listener).await {
            tracing::error!(error = %e, "Server error");
        }
    });

    Ok((handle, local_addr))
}
