use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialConfig;
use crate::duration::{deserialize_duration, deserialize_duration_opt};

/// How the browser's request pipeline is observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapMode {
    /// Passive network events; requests are never paused.
    #[default]
    Observe,
    /// Fetch-domain interception; every paused request is continued unmodified.
    Intercept,
}

fn default_navigation_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Browser launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,

    /// Explicit Chrome/Chromium binary. Auto-detected when unset.
    pub chrome_path: Option<PathBuf>,

    /// Persistent profile directory. If relative, resolved from config file location.
    ///
    /// When unset every run gets a fresh, isolated browser context.
    pub user_data_dir: Option<PathBuf>,

    #[serde(
        default = "default_navigation_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub navigation_timeout: Duration,

    pub tap_mode: TapMode,

    /// Extra command-line switches passed to the browser.
    pub args: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            user_data_dir: None,
            navigation_timeout: default_navigation_timeout(),
            tap_mode: TapMode::default(),
            args: Vec::new(),
        }
    }
}

/// Where the target application lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,

    /// Path of the authenticated page whose load fires the token-bearing calls.
    /// `{location}` is replaced by the location identifier.
    pub capture_path: String,

    /// URL fragments that identify the login page after a redirect.
    pub login_url_markers: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.onetoo.com".to_string(),
            capture_path: "/v2/location/{location}/settings/private-integrations/".to_string(),
            login_url_markers: vec!["/login".to_string(), "/signin".to_string()],
        }
    }
}

impl TargetConfig {
    /// Deep link for a location. Unauthenticated sessions are redirected
    /// from here to the login page.
    pub fn capture_url(&self, location_id: &str) -> String {
        let path = self.capture_path.replace("{location}", location_id);
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Visible text used to locate controls on the login and challenge pages.
///
/// Matching is case-insensitive and by substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub email_placeholders: Vec<String>,
    pub password_placeholders: Vec<String>,
    pub sign_in_labels: Vec<String>,
    pub send_code_labels: Vec<String>,
    pub verify_labels: Vec<String>,
    /// CSS selector matching the single-character code inputs.
    pub digit_input: String,
    /// Page text that indicates a verification challenge.
    pub challenge_markers: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            email_placeholders: owned(&["your email address", "email"]),
            password_placeholders: owned(&["the password you picked", "password"]),
            sign_in_labels: owned(&["sign in", "log in", "login"]),
            send_code_labels: owned(&["send security code", "send code"]),
            verify_labels: owned(&["verify", "confirm", "submit"]),
            digit_input: "input[maxlength=\"1\"]".to_string(),
            challenge_markers: owned(&["verification", "security code"]),
        }
    }
}

fn default_freshness() -> Duration {
    crate::mail::DEFAULT_FRESHNESS
}

fn default_retry_delay() -> Duration {
    crate::mail::DEFAULT_RETRY_DELAY
}

/// Mailbox that receives verification codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    /// Login name. The password is looked up as `mailbox_password`.
    pub username: Option<String>,
    pub folder: String,
    pub sender: String,
    /// Substring the subject must contain.
    pub subject: String,
    /// Ordered code patterns; built-in patterns are used when empty.
    pub code_patterns: Vec<String>,

    #[serde(default = "default_freshness", deserialize_with = "deserialize_duration")]
    pub freshness: Duration,

    pub max_attempts: u32,

    #[serde(
        default = "default_retry_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_delay: Duration,

    pub lookback_days: u64,
    pub mark_seen: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            username: None,
            folder: "INBOX".to_string(),
            sender: "noreply@talk.onetoo.com".to_string(),
            subject: "Login security code".to_string(),
            code_patterns: Vec::new(),
            freshness: default_freshness(),
            max_attempts: crate::mail::DEFAULT_MAX_ATTEMPTS,
            retry_delay: default_retry_delay(),
            lookback_days: 1,
            mark_seen: true,
        }
    }
}

fn default_challenge_window() -> Duration {
    Duration::from_secs(8)
}

fn default_quiescence_idle() -> Duration {
    Duration::from_secs(2)
}

fn default_quiescence_max() -> Duration {
    Duration::from_secs(20)
}

/// Timing of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// How long to watch for a verification prompt after signing in.
    #[serde(
        default = "default_challenge_window",
        deserialize_with = "deserialize_duration"
    )]
    pub challenge_window: Duration,

    /// Network is quiet once no request has been seen for this long.
    #[serde(
        default = "default_quiescence_idle",
        deserialize_with = "deserialize_duration"
    )]
    pub quiescence_idle: Duration,

    /// Upper bound on waiting for quiescence.
    #[serde(
        default = "default_quiescence_max",
        deserialize_with = "deserialize_duration"
    )]
    pub quiescence_max: Duration,

    pub min_token_length: usize,

    /// Overall wall-clock budget. Derived from the other timings when unset.
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    pub budget: Option<Duration>,

    /// Where a screenshot of a failed run is written, named by run id.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            challenge_window: default_challenge_window(),
            quiescence_idle: default_quiescence_idle(),
            quiescence_max: default_quiescence_max(),
            min_token_length: crate::tap::DEFAULT_MIN_TOKEN_LENGTH,
            budget: None,
            screenshot_dir: None,
        }
    }
}

/// Optional secondary-token flow run after a successful capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub enabled: bool,
    pub name: String,
    pub scopes: Vec<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        let scopes = [
            "View Contacts",
            "Edit Contacts",
            "View Conversation Messages",
            "Edit Conversation Messages",
            "View Calendars",
            "View Custom Fields",
            "View Custom Values",
            "View Tags",
        ];
        Self {
            enabled: false,
            name: "location key".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Where run results are delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sink", rename_all = "lowercase")]
pub enum ReportConfig {
    #[default]
    None,
    /// One JSON file per run. If relative, resolved from config file location.
    File { dir: PathBuf },
    /// POST the result as JSON.
    Http {
        url: String,
        #[serde(
            default = "default_http_timeout",
            deserialize_with = "deserialize_duration"
        )]
        timeout: Duration,
    },
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub target: TargetConfig,
    pub selectors: SelectorConfig,
    pub mail: MailConfig,
    pub run: RunConfig,
    pub integration: IntegrationConfig,
    pub report: ReportConfig,

    /// Secret backend. Environment variables are used when unset.
    pub credentials: Option<CredentialConfig>,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Make relative paths absolute against `config_dir`.
    pub fn resolve_paths(&mut self, config_dir: &Path) {
        if let Some(dir) = self.browser.user_data_dir.as_mut() {
            *dir = resolve(config_dir, dir);
        }
        if let ReportConfig::File { dir } = &mut self.report {
            *dir = resolve(config_dir, dir);
        }
        if let Some(dir) = self.run.screenshot_dir.as_mut() {
            *dir = resolve(config_dir, dir);
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The file this was loaded from, or would have been.
    pub config_path: PathBuf,
    pub config: Config,
}

impl std::ops::Deref for ResolvedConfig {
    type Target = Config;

    fn deref(&self) -> &Config {
        &self.config
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./authtap.toml` if it exists in current directory
/// 2. `~/.config/authtap/authtap.toml`
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("authtap.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("authtap").join("authtap.toml");
    }

    local_config
}

impl ResolvedConfig {
    /// Load and resolve config from a file path.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("Config file not found: {}", config_path.display()))?;

        let config_dir = config_path
            .parent()
            .context("Config file has no parent directory")?;

        let mut config = Config::load(&config_path)?;
        config.resolve_paths(config_dir);

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load config, falling back to defaults if the file doesn't exist.
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        let config_path = if config_path.is_relative() {
            std::env::current_dir()
                .context("Failed to get current directory")?
                .join(config_path)
        } else {
            config_path.to_path_buf()
        };

        Ok(Self {
            config_path,
            config: Config::default(),
        })
    }
}
