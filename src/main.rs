use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use authtap::automation::{run_automation, Target};
use authtap::config::{default_config_path, ResolvedConfig};
use authtap::credentials::TARGET_PASSWORD;
use authtap::duration::format_duration;
use authtap::token;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "authtap")]
#[command(about = "Log in through a real browser and capture the session credentials")]
struct Cli {
    /// Path to config file (default: ./authtap.toml, then ~/.config/authtap/authtap.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and capture tokens for one location
    Run {
        /// Account email address
        #[arg(long)]
        email: String,

        /// Location to open after login
        #[arg(long)]
        location: String,

        /// Opaque identity echoed back in the result
        #[arg(long)]
        callback: Option<String>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        /// Override the login URL (default: the location's capture page)
        #[arg(long)]
        login_url: Option<String>,
    },
    /// Decode a session token's claims without verifying it
    Decode {
        token: String,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off",
            )
        }))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "authtap failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = ResolvedConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load authtap config: {}", config_path.display()))?;

    match cli.command {
        Command::Run {
            email,
            location,
            callback,
            headed,
            login_url,
        } => {
            if headed {
                config.config.browser.headless = false;
            }

            let store = config.credentials.clone().unwrap_or_default().build();
            let password = store.require(TARGET_PASSWORD).await?;
            let login_url = login_url.unwrap_or_else(|| config.target.capture_url(&location));

            let mut target = Target::new(login_url, email, password, location);
            if let Some(callback) = callback {
                target = target.with_callback_identity(callback);
            }

            let result = run_automation(&config, store.as_ref(), &target).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Decode { token } => {
            let claims = token::decode_claims(&token)?;
            let output = serde_json::json!({
                "subject_id": claims.subject,
                "issued_at": claims.issued_at,
                "expires_at": claims.expires_at,
                "claims": claims.raw,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            let timings = &config.run;
            println!("Config file: {}", config.config_path.display());
            println!("Target: {}", config.target.base_url);
            println!("Mailbox: {}:{}/{}", config.mail.host, config.mail.port, config.mail.folder);
            println!("Headless: {}", config.browser.headless);
            println!("Tap mode: {:?}", config.browser.tap_mode);
            println!("Challenge window: {}", format_duration(timings.challenge_window));
            println!(
                "OTP: {} attempts, {} apart, fresh for {}",
                config.mail.max_attempts,
                format_duration(config.mail.retry_delay),
                format_duration(config.mail.freshness)
            );
            match timings.budget {
                Some(budget) => println!("Run budget: {}", format_duration(budget)),
                None => println!("Run budget: derived"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
