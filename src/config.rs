//! Configuration loaded from the environment (and `.env`, via dotenvy in main)

use crate::converter::DEFAULT_MAX_UPLOAD_BYTES;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
const DEFAULT_RATE_LIMIT_MAX: u64 = 20;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_USER_NAME: &str = "File Converter Admin";
const MIN_PASSWORD_LEN: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub max_upload_bytes: u64,
    pub render_timeout: Duration,
    pub chrome_path: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
}

/// Per-client request allowance: `max` requests per `window`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub max: u32,
    pub window: Duration,
}

/// The single account allowed to use the service
#[derive(Clone)]
pub struct AuthConfig {
    pub email: String,
    pub name: String,
    /// Plain text, or `sha256:<hex digest>`
    pub password: String,
    pub token_ttl: Duration,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let max_upload_bytes = parse_positive(&get, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        let render_timeout_secs =
            parse_positive(&get, "RENDER_TIMEOUT_SECS", DEFAULT_RENDER_TIMEOUT_SECS)?;
        let token_ttl_secs = parse_positive(&get, "AUTH_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?;
        let rate_limit_max = parse_positive(&get, "RATE_LIMIT_MAX", DEFAULT_RATE_LIMIT_MAX)?;
        let rate_limit_max = u32::try_from(rate_limit_max).map_err(|_| ConfigError::Invalid {
            name: "RATE_LIMIT_MAX",
            reason: format!("must be at most {}", u32::MAX),
        })?;
        let rate_limit_window_ms =
            parse_positive(&get, "RATE_LIMIT_WINDOW_MS", DEFAULT_RATE_LIMIT_WINDOW_MS)?;

        let email = require("AUTH_USER_EMAIL")?;
        if !looks_like_email(&email) {
            return Err(ConfigError::Invalid {
                name: "AUTH_USER_EMAIL",
                reason: format!("'{}' is not an email address", email),
            });
        }

        let password = require("AUTH_USER_PASSWORD")?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ConfigError::Invalid {
                name: "AUTH_USER_PASSWORD",
                reason: format!("must be at least {} characters", MIN_PASSWORD_LEN),
            });
        }

        Ok(Config {
            addr: get("PDFFORGE_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            max_upload_bytes,
            render_timeout: Duration::from_secs(render_timeout_secs),
            chrome_path: get("CHROME_PATH"),
            rate_limit: RateLimitConfig {
                max: rate_limit_max,
                window: Duration::from_millis(rate_limit_window_ms),
            },
            auth: AuthConfig {
                email,
                name: get("AUTH_USER_NAME").unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
                password,
                token_ttl: Duration::from_secs(token_ttl_secs),
            },
        })
    }
}

fn parse_positive<G>(get: &G, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) => Err(ConfigError::Invalid {
                name,
                reason: "must be greater than zero".to_string(),
            }),
            Ok(value) => Ok(value),
            Err(e) => Err(ConfigError::Invalid {
                name,
                reason: format!("'{}': {}", raw, e),
            }),
        },
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}
