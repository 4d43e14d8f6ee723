//! Credential backend selection, as written in the `[credentials]` table.

use serde::{Deserialize, Serialize};

use super::env::{EnvConfig, EnvCredentialStore};
use super::pass::{PassConfig, PassCredentialStore};
use super::CredentialStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CredentialConfig {
    /// Password-store (pass) backend.
    Pass {
        #[serde(flatten)]
        config: PassConfig,
    },
    /// Environment variables.
    Env {
        #[serde(flatten)]
        config: EnvConfig,
    },
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig::Env {
            config: EnvConfig::default(),
        }
    }
}

impl CredentialConfig {
    /// Build a credential store from this configuration.
    pub fn build(&self) -> Box<dyn CredentialStore> {
        match self {
            CredentialConfig::Pass { config } => Box::new(PassCredentialStore::new(config.clone())),
            CredentialConfig::Env { config } => Box::new(EnvCredentialStore::new(config.clone())),
        }
    }
}
