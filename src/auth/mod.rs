//! Single-user authentication.
//!
//! One account comes from configuration. Its password may be plain text,
//! a bcrypt hash or `sha256:<hex>`. A successful login issues an opaque
//! bearer token that stays valid for the configured lifetime. Tokens live in
//! memory only, so a restart logs everyone out.

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

const SHA256_PREFIX: &str = "sha256:";
const BCRYPT_PREFIXES: [&str; 3] = ["$2a$", "$2b$", "$2y$"];
/// Length of a modular-crypt bcrypt string
const BCRYPT_HASH_LEN: usize = 60;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// The account as shown to clients, never including the password
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub user: Profile,
}

/// How the configured password is stored
enum StoredPassword {
    /// Plain text or `sha256:<hex>`, compared by SHA-256 digest
    Digest([u8; 32]),
    /// A `$2a$`/`$2b$`/`$2y$` bcrypt hash
    Bcrypt(String),
}

impl StoredPassword {
    fn parse(stored: &str) -> Result<Self> {
        if BCRYPT_PREFIXES.iter().any(|p| stored.starts_with(p)) {
            if stored.len() != BCRYPT_HASH_LEN {
                return Err(AppError::Internal(
                    "Password bcrypt hash must be 60 characters".to_string(),
                ));
            }
            return Ok(StoredPassword::Bcrypt(stored.to_string()));
        }
        match stored.strip_prefix(SHA256_PREFIX) {
            Some(hex_digest) => decode_digest(hex_digest).map(StoredPassword::Digest),
            None => Ok(StoredPassword::Digest(digest(stored))),
        }
    }

    async fn verify(&self, candidate: &str) -> Result<bool> {
        match self {
            StoredPassword::Digest(expected) => Ok(digest(candidate) == *expected),
            StoredPassword::Bcrypt(hash) => {
                let (candidate, hash) = (candidate.to_string(), hash.clone());
                let verified = tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash))
                    .await
                    .map_err(|e| AppError::Internal(format!("Password check failed: {}", e)))?;
                verified.or_else(|e| {
                    warn!("Stored bcrypt hash could not be checked: {}", e);
                    Ok(false)
                })
            }
        }
    }
}

pub struct AuthService {
    profile: Profile,
    password: StoredPassword,
    token_ttl: Duration,
    sessions: RwLock<HashMap<String, Instant>>,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let password = StoredPassword::parse(&config.password)?;

        Ok(Self {
            profile: Profile {
                id: config.email.clone(),
                email: config.email.clone(),
                name: config.name.clone(),
            },
            password,
            token_ttl: config.token_ttl,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Check credentials and open a session
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let email_matches = request.email.trim().eq_ignore_ascii_case(&self.profile.email);
        let password_matches = email_matches && self.password.verify(&request.password).await?;
        if !password_matches {
            warn!("Rejected login attempt for {}", request.email);
            return Err(AppError::Unauthorized("Invalid email or password".to_string()));
        }

        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let now = Instant::now();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|_, expires| *expires > now);
            sessions.insert(token.clone(), now + self.token_ttl);
        }
        info!("User {} logged in", self.profile.email);

        Ok(LoginResponse {
            access_token: token,
            token_type: "Bearer",
            expires_in: self.token_ttl.as_secs(),
            user: self.profile.clone(),
        })
    }

    /// Resolve a bearer token to the account it was issued for
    pub async fn authenticate(&self, token: &str) -> Result<Profile> {
        let expires = self.sessions.read().await.get(token).copied();
        match expires {
            Some(expires) if expires > Instant::now() => Ok(self.profile.clone()),
            Some(_) => {
                self.sessions.write().await.remove(token);
                Err(AppError::Unauthorized("Session expired".to_string()))
            }
            None => Err(AppError::Unauthorized("Invalid access token".to_string())),
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn decode_digest(hex_digest: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_digest.trim())
        .map_err(|e| AppError::Internal(format!("Invalid password digest: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| AppError::Internal("Password digest must be 32 bytes".to_string()))
}
