//! Secret lookup.
//!
//! The target account password and the mailbox password are never stored in
//! `authtap.toml`. A `[credentials]` section names the backend they come from:
//!
//! ```toml
//! [credentials]
//! backend = "pass"
//! path = "work/onetoo"
//!
//! [credentials.fields]
//! target_password = "password"
//! mailbox_password = "imap-app-password"
//! ```

mod config;
mod env;
mod pass;

pub use config::CredentialConfig;
pub use env::{EnvConfig, EnvCredentialStore};
pub use pass::{PassConfig, PassCredentialStore};

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;

/// Key for the password of the account being logged in.
pub const TARGET_PASSWORD: &str = "target_password";

/// Key for the password (or app password) of the verification mailbox.
pub const MAILBOX_PASSWORD: &str = "mailbox_password";

/// A read-only key-value store for secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Retrieve a credential by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    /// Returns `Err` if there was an error accessing the backend.
    async fn get(&self, key: &str) -> Result<Option<SecretString>>;

    /// Like [`get`](Self::get), but a missing key is an error.
    async fn require(&self, key: &str) -> Result<SecretString> {
        self.get(key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Credential {key:?} is not set"))
    }
}
