//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::db::Database;
use crate::media::{LocalMediaStore, MediaStore};
use crate::password::HashingConfig;
use axum::http::HeaderName;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MIN_SECRET_LENGTH: usize = 32;

/// Upper bound for token lifetimes: 10 years
const MAX_TOKEN_EXPIRY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "Vidtube", about = "Video platform account and session server")]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "DATABASE_PATH", default_value = "vidtube.db")]
    pub database: String,

    /// Directory uploaded avatars and cover images are written to
    #[arg(long, env = "MEDIA_DIR", default_value = "media")]
    pub media_dir: String,

    /// Public URL the media directory is served from
    #[arg(long, env = "MEDIA_BASE_URL", default_value = "http://localhost:8000/media")]
    pub media_base_url: String,

    /// Access token lifetime in seconds
    #[arg(
        long,
        env = "ACCESS_TOKEN_EXPIRY",
        default_value = "900",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TOKEN_EXPIRY_SECS)
    )]
    pub access_token_expiry: u64,

    /// Refresh token lifetime in seconds
    #[arg(
        long,
        env = "REFRESH_TOKEN_EXPIRY",
        default_value = "864000",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TOKEN_EXPIRY_SECS)
    )]
    pub refresh_token_expiry: u64,

    /// Path to file containing the access token secret. Prefer the ACCESS_TOKEN_SECRET env var
    #[arg(long)]
    pub access_token_secret_file: Option<String>,

    /// Path to file containing the refresh token secret. Prefer the REFRESH_TOKEN_SECRET env var
    #[arg(long)]
    pub refresh_token_secret_file: Option<String>,

    /// Do not set the Secure flag on cookies (plain HTTP development only)
    #[arg(long)]
    pub insecure_cookies: bool,

    /// Header containing the client IP, e.g. "x-forwarded-for" (requires a reverse proxy)
    #[arg(long, value_parser = parse_header_name)]
    pub ip_header: Option<HeaderName>,

    /// Maximum number of password hashes computed concurrently
    #[arg(long, default_value = "4")]
    pub max_concurrent_hashes: usize,

    /// Timeout for each session store operation, in milliseconds
    #[arg(long, default_value = "5000")]
    pub store_timeout_ms: u64,

    /// Disable per-IP rate limiting on login, register and refresh
    #[arg(long)]
    pub no_rate_limit: bool,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

fn parse_header_name(s: &str) -> Result<HeaderName, String> {
    HeaderName::try_from(s.trim()).map_err(|e| format!("Invalid header name {:?}: {}", s, e))
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Both signing secrets.
pub struct Secrets {
    pub access: String,
    pub refresh: String,
}

/// Load a secret from an environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
fn load_secret(env_var: &str, file: Option<&str>, flag: &str) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var(env_var) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(env_var) };
        secret
    } else if let Some(path) = file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read secret file");
                return None;
            }
        }
    } else {
        error!(
            "{} is required. Set the environment variable (recommended) or use {}",
            env_var, flag
        );
        return None;
    };

    if secret.len() < MIN_SECRET_LENGTH {
        error!(
            "{} is shorter than {} characters. Use a longer secret",
            env_var, MIN_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Load the access and refresh token secrets. They must differ.
pub fn load_secrets(args: &Args) -> Option<Secrets> {
    let access = load_secret(
        "ACCESS_TOKEN_SECRET",
        args.access_token_secret_file.as_deref(),
        "--access-token-secret-file",
    )?;
    let refresh = load_secret(
        "REFRESH_TOKEN_SECRET",
        args.refresh_token_secret_file.as_deref(),
        "--refresh-token-secret-file",
    )?;

    if access == refresh {
        error!("ACCESS_TOKEN_SECRET and REFRESH_TOKEN_SECRET must be different");
        return None;
    }

    Some(Secrets { access, refresh })
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

/// Open the media store, logging errors if it fails.
pub async fn open_media_store(dir: &str, base_url: &str) -> Option<Arc<dyn MediaStore>> {
    match LocalMediaStore::open(dir, base_url).await {
        Ok(store) => {
            info!(path = %dir, base_url = %base_url, "Media store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            error!(path = %dir, error = %e, "Failed to open media store");
            None
        }
    }
}

/// Build ServerConfig from validated arguments.
pub fn build_config(
    args: &Args,
    db: Database,
    media: Arc<dyn MediaStore>,
    secrets: Secrets,
) -> ServerConfig {
    if args.insecure_cookies {
        warn!("Cookies are issued without the Secure flag");
    }
    if args.no_rate_limit {
        warn!("Rate limiting is disabled");
    }

    ServerConfig {
        db,
        media,
        access_secret: secrets.access.into_bytes(),
        refresh_secret: secrets.refresh.into_bytes(),
        access_token_expiry: args.access_token_expiry,
        refresh_token_expiry: args.refresh_token_expiry,
        secure_cookies: !args.insecure_cookies,
        hashing: HashingConfig {
            max_concurrent: args.max_concurrent_hashes,
            ..HashingConfig::default()
        },
        store_timeout: Duration::from_millis(args.store_timeout_ms),
        rate_limit: !args.no_rate_limit,
        ip_header: args.ip_header.clone(),
    }
}
