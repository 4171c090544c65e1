//! Dashboard login against a read-only credential store
//!
//! Credentials are loaded once at startup from a JSON array of
//! `{username, password, role?}` entries. How a stored secret is compared
//! with the supplied one is delegated to a `PasswordVerifier`.
//!
//! With the default `ConstantTimeVerifier` the `password` field holds the
//! plaintext secret. A store of password hashes needs a hashing verifier
//! installed through `CredentialStore::with_verifier`.

use crate::domain::error::CoordinatorError;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const LOGIN_OK: &str = "Login successful";
pub const USER_NOT_FOUND: &str = "User not found";
pub const INCORRECT_PASSWORD: &str = "Incorrect password";

#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<String>,
}

pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, supplied: &str, stored: &str) -> bool;
}

/// Plaintext comparison of the supplied secret with the stored value, without an early exit.
/// Stored hashes never match.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantTimeVerifier;

impl PasswordVerifier for ConstantTimeVerifier {
    fn verify(&self, supplied: &str, stored: &str) -> bool {
        let (a, b) = (supplied.as_bytes(), stored.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

pub struct CredentialStore {
    users: FxHashMap<String, Credential>,
    verifier: Arc<dyn PasswordVerifier>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self { users: FxHashMap::default(), verifier: Arc::new(ConstantTimeVerifier) }
    }
}

impl CredentialStore {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<Credential> = serde_json::from_str(json)?;
        let users = entries.into_iter().map(|c| (c.username.clone(), c)).collect();
        Ok(Self { users, verifier: Arc::new(ConstantTimeVerifier) })
    }

    /// Load from a file; a missing or malformed file yields an empty store
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "credentials_not_loaded");
                return Self::default();
            }
        };
        match Self::from_json(&content) {
            Ok(store) => {
                info!(file = %path.display(), users = %store.len(), "credentials_loaded");
                store
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "credentials_parse_failed");
                Self::default()
            }
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn login(&self, username: &str, password: &str) -> Result<&Credential, CoordinatorError> {
        let Some(credential) = self.users.get(username) else {
            return Err(CoordinatorError::AuthenticationFailure(USER_NOT_FOUND.to_string()));
        };
        if !self.verifier.verify(password, &credential.password) {
            return Err(CoordinatorError::AuthenticationFailure(INCORRECT_PASSWORD.to_string()));
        }
        Ok(credential)
    }
}
