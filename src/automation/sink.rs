//! Destinations for finished run results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::report::AutomationResult;

/// The external persistence collaborator.
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, result: &AutomationResult) -> Result<()>;
}

/// Writes one `<run_id>.json` file per run into a directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Use `~/.cache/authtap/results/`.
    pub fn new() -> Result<Self> {
        let dir = dirs::cache_dir()
            .context("Could not find cache directory")?
            .join("authtap")
            .join("results");
        Self::with_path(dir)
    }

    pub fn with_path(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create results dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn result_file(&self, result: &AutomationResult) -> PathBuf {
        self.dir.join(format!("{}.json", result.run_id))
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, result: &AutomationResult) -> Result<()> {
        let path = self.result_file(result);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(result).context("Failed to serialize result")?;

        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write result file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move result into place: {}", path.display()))?;

        tracing::info!(path = %path.display(), "Wrote result file");
        Ok(())
    }
}

/// POSTs the result as JSON to a collaborator endpoint.
#[cfg(feature = "automation")]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "automation")]
impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("authtap/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[cfg(feature = "automation")]
#[async_trait]
impl ResultSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, result: &AutomationResult) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(result)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("POST {} returned {status}: {}", self.url, body.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::run::{AutomationRun, RunStatus, Target};
    use secrecy::SecretString;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_sink_writes_one_file_per_run() -> Result<()> {
        let dir = TempDir::new()?;
        let sink = JsonFileSink::with_path(dir.path().join("results"))?;

        let run = AutomationRun::new(&Target::new(
            "https://app.example.com/x",
            "ops@example.com",
            SecretString::from("pw".to_string()),
            "loc-1",
        ));
        let result = AutomationResult::from_run(&run);
        sink.deliver(&result).await?;

        let written = std::fs::read_to_string(sink.result_file(&result))?;
        let parsed: AutomationResult = serde_json::from_str(&written)?;
        assert_eq!(parsed.run_id, result.run_id);
        assert_eq!(parsed.final_status, RunStatus::Pending);
        assert!(!parsed.success);

        let entries = std::fs::read_dir(dir.path().join("results"))?.count();
        assert_eq!(entries, 1);
        Ok(())
    }
}
