//! Secret-reveal boundary (external collaborator).

use async_trait::async_trait;
use thiserror::Error;

/// Secret error.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret reveal failed: {0}")]
    RevealFailed(String),
}

/// Usage metadata recorded for audit trails.
#[derive(Debug, Clone)]
pub struct SecretUsage {
    /// The instance (session/variant) the secret is revealed for.
    pub instance: String,
    /// What the plaintext is used for, e.g. `"session-create"`.
    pub purpose: String,
}

/// Trait for revealing decrypted configuration given a secret reference.
#[async_trait]
pub trait SecretReveal: Send + Sync {
    /// Reveal the plaintext behind a secret reference.
    ///
    /// # Errors
    /// Returns error if the reference is unknown or decryption fails.
    async fn reveal(&self, secret_ref: &str, usage: &SecretUsage) -> Result<String, SecretError>;
}

/// Fixed-map reveal service for tests and local development.
#[derive(Debug, Default)]
pub struct StaticSecrets {
    secrets: std::collections::HashMap<String, String>,
}

impl StaticSecrets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, secret_ref: impl Into<String>, plaintext: impl Into<String>) -> Self {
        self.secrets.insert(secret_ref.into(), plaintext.into());
        self
    }
}

#[async_trait]
impl SecretReveal for StaticSecrets {
    async fn reveal(&self, secret_ref: &str, usage: &SecretUsage) -> Result<String, SecretError> {
        tracing::debug!(secret_ref, instance = %usage.instance, purpose = %usage.purpose, "secret revealed");
        self.secrets
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(secret_ref.to_string()))
    }
}
