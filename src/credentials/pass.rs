//! Password-store (pass) credential backend.
//!
//! One entry holds both secrets. The first line is exposed as `password`;
//! later `name: value` lines are exposed by name.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::CredentialStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    /// Entry path, e.g. `work/onetoo`.
    pub path: String,

    /// Logical key to entry field. Unmapped keys are looked up as-is.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

pub struct PassCredentialStore {
    config: PassConfig,
}

impl PassCredentialStore {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    fn field_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.config
            .fields
            .get(key)
            .map(String::as_str)
            .unwrap_or(key)
    }

    async fn show(&self) -> Result<HashMap<String, String>> {
        let output = Command::new("pass")
            .arg("show")
            .arg(&self.config.path)
            .output()
            .await
            .context("Failed to run pass")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("pass show {} failed: {}", self.config.path, stderr.trim());
        }

        let content = String::from_utf8(output.stdout).context("Invalid UTF-8 in pass output")?;
        Ok(parse_entry(&content))
    }
}

#[async_trait]
impl CredentialStore for PassCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let mut fields = self.show().await?;
        Ok(fields.remove(self.field_name(key)).map(SecretString::from))
    }
}

fn parse_entry(content: &str) -> HashMap<String, String> {
    let mut lines = content.lines();
    let mut fields = HashMap::new();

    if let Some(first) = lines.next().filter(|l| !l.is_empty()) {
        fields.insert("password".to_string(), first.to_string());
    }
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if !value.is_empty() {
                fields.insert(name.trim().to_string(), value.to_string());
            }
        }
    }
    fields
}
