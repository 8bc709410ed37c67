//! Session CLI
//!
//! Command-line front end for the authenticated API client:
//! 1. Loads TOML config with env overrides
//! 2. Opens the credential file (encrypted when a key is configured)
//! 3. Runs one subcommand and prints its JSON result to stdout
//!
//! Logs go to stderr as JSON so stdout stays machine-readable.

mod cli;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use api_client::ApiClient;
use auth_storage::{CredentialStore, FileStore, KeyValueStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Command, USAGE};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, rest) = cli::split_config_flag(&args);

    let command = match Command::parse(&rest, std::env::var("API_PASSWORD").ok()) {
        Ok(command) => command,
        Err(reason) => {
            eprintln!("{reason}\n\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };

    let config_path = Config::resolve_path(cli_config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let backend: Arc<dyn KeyValueStore> = match config.storage.encryption_key {
        Some(ref key) => Arc::new(FileStore::encrypted(config.storage.path.clone(), key)),
        None => Arc::new(FileStore::new(config.storage.path.clone())),
    };
    info!(
        base_url = %config.api.base_url,
        storage = %config.storage.path.display(),
        encrypted = config.storage.encryption_key.is_some(),
        auth_header = ?config.api.auth_header,
        "configuration loaded"
    );

    let store = Arc::new(CredentialStore::with_logging(backend));
    let client = ApiClient::new(config.client_config(), store)
        .context("failed to build HTTP client")?;

    let name = command.name();
    match cli::run(command, &client).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(command = name, error = %e, "command failed");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "error": e }))?
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
