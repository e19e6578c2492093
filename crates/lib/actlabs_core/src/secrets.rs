//! Secret stores that do not need a vault.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cloud::{ProviderError, SecretStore};

/// Environment variable holding secret `name`
/// (`protected-lab-secret` → `PROTECTED_LAB_SECRET`).
pub fn env_var_name(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

/// Resolves secrets from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn secret(&self, name: &str) -> Result<String, ProviderError> {
        let var = env_var_name(name);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(ProviderError::NotFound(format!(
                "secret {name} is not set ({var})"
            ))),
        }
    }
}

/// Fixed secrets, for local runs and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn secret(&self, name: &str) -> Result<String, ProviderError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("secret {name}")))
    }
}
