//! Environment-variable credential backend.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::CredentialStore;

fn default_prefix() -> String {
    "AUTHTAP_".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Prepended to the upper-cased key, e.g. `AUTHTAP_TARGET_PASSWORD`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Explicit variable names per key, overriding the prefix rule.
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            vars: HashMap::new(),
        }
    }
}

pub struct EnvCredentialStore {
    config: EnvConfig,
}

impl EnvCredentialStore {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    fn var_name(&self, key: &str) -> String {
        self.config
            .vars
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.config.prefix, key.to_ascii_uppercase()))
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let name = self.var_name(key);
        match std::env::var(&name) {
            Ok(value) if !value.is_empty() => Ok(Some(SecretString::from(value))),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => {
                anyhow::bail!("Environment variable {name} is not valid UTF-8")
            }
        }
    }
}
