//! Credentials file parsing for restricted items.
//!
//! The archive accepts S3-style keys via an `authorization: LOW access:secret`
//! header. The credentials file uses `key=value` lines with `#` comments;
//! recognized keys are `S3_ACCESS_KEY`/`S3_SECRET_KEY` (case-insensitive)
//! with `access`/`secret` accepted as shorthand.

use std::collections::HashMap;
use std::path::Path;

/// Errors from reading a credentials file.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// File missing or unreadable.
    #[error("auth file not readable: {0}")]
    Unreadable(String),

    /// File parsed but one or both keys were absent.
    #[error("auth file missing access/secret keys")]
    MissingKeys,
}

/// S3-style access credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
}

impl Credentials {
    /// Load credentials from a `key=value` file.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Unreadable(format!("{}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Parse credentials from file contents.
    pub fn parse(contents: &str) -> Result<Self, AuthError> {
        let mut values = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let access = values
            .get("s3_access_key")
            .or_else(|| values.get("access"))
            .filter(|v| !v.is_empty());
        let secret = values
            .get("s3_secret_key")
            .or_else(|| values.get("secret"))
            .filter(|v| !v.is_empty());

        match (access, secret) {
            (Some(access), Some(secret)) => Ok(Self {
                access_key: access.clone(),
                secret_key: secret.clone(),
            }),
            _ => Err(AuthError::MissingKeys),
        }
    }

    /// Header value in the archive's documented format.
    pub fn authorization_header(&self) -> String {
        format!("LOW {}:{}", self.access_key, self.secret_key)
    }
}
