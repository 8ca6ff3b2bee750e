//! Secret store backed by a Vault KV read.
//!
//! Any configuration string of the form `lookup_secret::<name>` is replaced
//! by the secret `<name>` before use.

use crate::device::Credential;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const LOOKUP_PREFIX: &str = "lookup_secret::";

const VAULT_TIMEOUT_SECS: u64 = 20;

/// Errors from loading or resolving secrets.
#[derive(Error, Debug)]
pub enum SecretsError {
    /// Transport error talking to vault.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Vault answered with a non-success status.
    #[error("vault returned {status} for {path}: {message}")]
    Vault {
        status: u16,
        path: String,
        message: String,
    },

    /// The secrets path holds no data.
    #[error("read on vault secrets path {0} returned no data")]
    Empty(String),

    /// A referenced secret is not present in the store.
    #[error("secret '{0}' not found, has it been set in vault under the secrets path?")]
    NotFound(String),

    /// `lookup_secret::` with nothing after the prefix.
    #[error("invalid secret lookup: {0}")]
    InvalidLookup(String),
}

/// Connection details for vault.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub host_address: String,
    pub secrets_path: String,
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    data: HashMap<String, String>,
}

impl SecretStore {
    #[must_use]
    pub fn from_map(data: HashMap<String, String>) -> Self {
        Self { data }
    }

    /// Read every key under the configured secrets path.
    ///
    /// Both KV v1 (`{"data": {...}}`) and KV v2 (`{"data": {"data": {...}}}`)
    /// response shapes are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if vault is unreachable, answers with a non-success
    /// status, or the path holds no data.
    pub async fn load_from_vault(settings: &VaultSettings) -> Result<Self, SecretsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(VAULT_TIMEOUT_SECS))
            .build()?;

        let path = settings.secrets_path.trim_start_matches('/');
        let url = format!(
            "{}/v1/{}",
            settings.host_address.trim_end_matches('/'),
            path
        );
        debug!(url = %url, "Reading secrets from vault");

        let response = client
            .get(&url)
            .header("X-Vault-Token", &settings.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SecretsError::Vault {
                status: status.as_u16(),
                path: settings.secrets_path.clone(),
                message,
            });
        }

        let body: Value = response.json().await?;
        let data = match body.get("data") {
            Some(Value::Object(outer)) => match outer.get("data") {
                Some(Value::Object(inner)) if outer.contains_key("metadata") => inner.clone(),
                _ => outer.clone(),
            },
            _ => return Err(SecretsError::Empty(settings.secrets_path.clone())),
        };

        let mut secrets = HashMap::with_capacity(data.len());
        for (key, value) in data {
            match value {
                Value::String(s) => {
                    secrets.insert(key, s);
                }
                Value::Number(n) => {
                    secrets.insert(key, n.to_string());
                }
                Value::Bool(b) => {
                    secrets.insert(key, b.to_string());
                }
                _ => warn!(key = %key, "Ignoring non-scalar vault secret"),
            }
        }

        Ok(Self { data: secrets })
    }

    /// # Errors
    ///
    /// Returns [`SecretsError::NotFound`] when the key is absent.
    pub fn get(&self, key: &str) -> Result<&str, SecretsError> {
        self.data
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    /// Resolve a value that may carry the lookup prefix; other values are
    /// returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty lookup name or a missing secret.
    pub fn resolve(&self, value: &str) -> Result<String, SecretsError> {
        let Some(name) = value.strip_prefix(LOOKUP_PREFIX) else {
            return Ok(value.to_string());
        };
        if name.is_empty() {
            return Err(SecretsError::InvalidLookup(value.to_string()));
        }
        self.get(name).map(ToString::to_string)
    }

    /// # Errors
    ///
    /// Returns the first lookup failure.
    pub fn resolve_credentials(&self, credentials: &mut [Credential]) -> Result<(), SecretsError> {
        for credential in credentials {
            credential.username = self.resolve(&credential.username)?;
            credential.password = self.resolve(&credential.password)?;
        }
        Ok(())
    }

    /// Replace every lookup string anywhere in a YAML document.
    ///
    /// # Errors
    ///
    /// Returns the first lookup failure.
    pub fn resolve_yaml(&self, value: &mut serde_yaml::Value) -> Result<(), SecretsError> {
        match value {
            serde_yaml::Value::String(s) if s.starts_with(LOOKUP_PREFIX) => {
                *s = self.resolve(s)?;
            }
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    self.resolve_yaml(item)?;
                }
            }
            serde_yaml::Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.resolve_yaml(item)?;
                }
            }
            serde_yaml::Value::Tagged(tagged) => self.resolve_yaml(&mut tagged.value)?,
            _ => {}
        }
        Ok(())
    }
}
