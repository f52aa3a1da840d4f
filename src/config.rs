use anyhow::{Context, Result};
use std::path::PathBuf;

/// Minimum PBKDF2 iteration count accepted at construction.
/// Weaker values are rejected eagerly rather than at first use.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Cryptography parameters for the credential vault.
///
/// Every field is enumerated and validated when the cipher is built; a
/// missing or malformed value fails construction instead of surfacing later
/// on the first encrypt call.
#[derive(Clone, Debug)]
pub struct CryptoConfig {
    /// Application secret used as the PBKDF2 password
    pub secret: String,

    /// Fixed PBKDF2 salt
    pub salt: String,

    /// PBKDF2-HMAC-SHA256 iteration count (>= 100,000)
    pub pbkdf2_iterations: u32,

    /// If true, a sealing failure latches encryption off for the rest of the
    /// session and tokens are stored in plaintext with a warn-level audit
    /// event. Default false: sealing failures are surfaced and nothing is
    /// persisted.
    pub allow_plaintext_fallback: bool,
}

impl CryptoConfig {
    pub fn validate(&self) -> std::result::Result<(), crate::error::AuthError> {
        use crate::error::AuthError;

        if self.secret.is_empty() {
            return Err(AuthError::Config("crypto secret must not be empty".into()));
        }
        if self.salt.is_empty() {
            return Err(AuthError::Config("crypto salt must not be empty".into()));
        }
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(AuthError::Config(format!(
                "pbkdf2_iterations must be >= {} (got {})",
                MIN_PBKDF2_ITERATIONS, self.pbkdf2_iterations
            )));
        }
        Ok(())
    }
}

/// Configuration for the credential lifecycle manager
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Refresh endpoint URL (POST, ambient cookies carried)
    pub refresh_url: String,

    /// Verification endpoint URL (GET with bearer token)
    pub verify_url: String,

    /// Auto-refresh polling interval in seconds
    pub check_interval_secs: u64,

    /// Refresh when time-to-expiry drops to this many seconds
    pub refresh_threshold_secs: i64,

    /// HTTP request timeout in seconds
    pub http_timeout_secs: u64,

    /// SQLite store location; None means the platform-local default
    pub store_path: Option<PathBuf>,

    /// Cryptography parameters
    pub crypto: CryptoConfig,
}

impl AuthConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Reads a `.env` file if one exists. `CREDLOCK_REFRESH_URL`,
    /// `CREDLOCK_VERIFY_URL`, `CREDLOCK_SECRET` and `CREDLOCK_SALT` are
    /// required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            refresh_url: std::env::var("CREDLOCK_REFRESH_URL")
                .context("CREDLOCK_REFRESH_URL is required")?,

            verify_url: std::env::var("CREDLOCK_VERIFY_URL")
                .context("CREDLOCK_VERIFY_URL is required")?,

            check_interval_secs: std::env::var("CREDLOCK_CHECK_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),

            refresh_threshold_secs: std::env::var("CREDLOCK_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            http_timeout_secs: std::env::var("CREDLOCK_HTTP_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            store_path: std::env::var("CREDLOCK_STORE_PATH")
                .ok()
                .map(|s| expand_tilde(&s)),

            crypto: CryptoConfig {
                secret: std::env::var("CREDLOCK_SECRET")
                    .context("CREDLOCK_SECRET is required")?,

                salt: std::env::var("CREDLOCK_SALT").context("CREDLOCK_SALT is required")?,

                pbkdf2_iterations: std::env::var("CREDLOCK_PBKDF2_ITERATIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(MIN_PBKDF2_ITERATIONS),

                allow_plaintext_fallback: std::env::var("CREDLOCK_ALLOW_PLAINTEXT_FALLBACK")
                    .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
        };

        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    /// Validate configuration, rejecting malformed values eagerly
    pub fn validate(&self) -> std::result::Result<(), crate::error::AuthError> {
        use crate::error::AuthError;

        if self.refresh_url.is_empty() {
            return Err(AuthError::Config("refresh_url must not be empty".into()));
        }
        if self.verify_url.is_empty() {
            return Err(AuthError::Config("verify_url must not be empty".into()));
        }
        if self.check_interval_secs == 0 {
            return Err(AuthError::Config("check_interval_secs must be > 0".into()));
        }
        if self.refresh_threshold_secs <= 0 {
            return Err(AuthError::Config(
                "refresh_threshold_secs must be > 0".into(),
            ));
        }
        self.crypto.validate()
    }

    /// Resolved SQLite store path (platform data dir when unset)
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("credlock")
                .join("credentials.db")
        })
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
