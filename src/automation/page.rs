//! The capability interface the orchestrator drives.
//!
//! Concrete selector strategies live behind [`LoginPage`], so the state
//! machine never knows how a field or button is located.

use std::time::Duration;

use async_trait::async_trait;

use crate::storage::StorageEntries;

/// Failure of a single page action.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("{action} timed out after {}ms", after.as_millis())]
    Timeout {
        action: &'static str,
        after: Duration,
    },
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("browser error: {0}")]
    Browser(String),
}

impl PageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PageError::Timeout { .. })
    }
}

/// Parameters for minting a long-lived integration credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationRequest {
    pub name: String,
    pub scopes: Vec<String>,
}

#[async_trait]
pub trait LoginPage: Send + Sync {
    /// Load `url` and wait for the document to settle.
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    async fn current_url(&self) -> Result<String, PageError>;

    /// Whether the page currently shows the credential form.
    async fn is_login_page(&self) -> Result<bool, PageError>;

    async fn fill_credentials(&self, email: &str, password: &str) -> Result<(), PageError>;

    async fn submit_login(&self) -> Result<(), PageError>;

    /// Watch for the second-factor prompt for up to `window`.
    async fn has_secondary_challenge(&self, window: Duration) -> Result<bool, PageError>;

    /// Press the control that emails a code. Returns `false` if the page
    /// offered no such control (the code may already be on its way).
    async fn request_code(&self) -> Result<bool, PageError>;

    /// Type `code` into the single-character inputs, left to right, and submit.
    async fn submit_digits(&self, code: &str) -> Result<(), PageError>;

    /// Read `localStorage` and `sessionStorage` of the current origin.
    async fn read_storage(&self) -> Result<StorageEntries, PageError> {
        Ok(StorageEntries::default())
    }

    /// Capture the viewport as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
        Err(PageError::NotFound("screenshot support".to_string()))
    }

    /// Drive the settings UI to mint an integration credential.
    ///
    /// Returns `Ok(None)` when the flow completed but no value could be read back.
    async fn create_integration_token(
        &self,
        request: &IntegrationRequest,
    ) -> Result<Option<String>, PageError>;
}
