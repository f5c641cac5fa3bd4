//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use credential_rotator::config::Config;
use credential_rotator::monitor::{FileRecordLoader, Monitor, RecordLoader};
use credential_rotator::targets::{self, TargetInstance};

#[derive(Parser)]
#[command(name = "credrot")]
#[command(about = "Watches a service account credentials file and applies changes to a target", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ROTATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Credentials file to watch (overrides config file)
    #[arg(long)]
    pub credentials_file: Option<PathBuf>,

    /// Name of the service whose account is managed (overrides config file)
    #[arg(long)]
    pub service_name: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "rotator-config.toml")]
        output: PathBuf,
    },

    /// Watch the credentials file and apply changes until interrupted
    Run,

    /// Load the credentials file once and check target access
    Check,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need configuration
    if let Commands::Init { output } = cli.command {
        Config::create_sample(&output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::from_env().context("Failed to load config from environment")?
    };

    // Override with CLI arguments if provided
    if let Some(path) = cli.credentials_file {
        config.monitor.credentials_file_path = path;
    }
    if let Some(name) = cli.service_name {
        config.monitor.target_service_name = name;
    }

    config.validate().context("Invalid configuration")?;

    let target = targets::create_target(&config).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above
        Commands::Run => run(&config, target).await,
        Commands::Check => check(&config, target).await,
    }
}

/// Monitor until Ctrl-C
async fn run(config: &Config, target: TargetInstance) -> Result<()> {
    validate_access(&config.monitor.target_service_name, &target).await;

    let loader = FileRecordLoader::new(&config.monitor.credentials_file_path);
    if config.monitor.create_placeholder {
        loader
            .ensure_placeholder(config.monitor.placeholder_secret_length)
            .context("Failed to create placeholder credentials record")?;
    }

    let cancel = CancellationToken::new();
    let monitor = Monitor::start(&config.monitor, target, cancel.clone())
        .context("Failed to start credentials monitoring")?;

    info!(
        "Credential rotator running for service '{}'. Press Ctrl-C to stop.",
        config.monitor.target_service_name
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    monitor.wait().await?;
    info!("Credential rotator stopped");
    Ok(())
}

/// Load the record once and report what would be applied
async fn check(config: &Config, target: TargetInstance) -> Result<()> {
    let loader = FileRecordLoader::new(&config.monitor.credentials_file_path);

    match loader.load() {
        Ok(Some(record)) => {
            println!("Credentials record: {:?}", loader.path());
            println!("  Username: {}", record.masked_username());
            println!("  Modified: {}", record.observed_at().to_rfc3339());
        }
        Ok(None) => {
            println!("No credentials record at {:?}", loader.path());
        }
        Err(e) => {
            error!("{}", e);
            anyhow::bail!("Credentials record is not usable");
        }
    }

    let reachable = validate_access(&config.monitor.target_service_name, &target).await;
    println!(
        "Target ({}) for service '{}': {}",
        target.target_type(),
        config.monitor.target_service_name,
        if reachable { "accessible" } else { "NOT accessible" }
    );
    Ok(())
}

/// Best-effort access check; failures are warnings, never fatal
async fn validate_access(service_name: &str, target: &TargetInstance) -> bool {
    match target.validate_access().await {
        Ok(true) => {
            info!("Access to service '{}' validated", service_name);
            true
        }
        Ok(false) => {
            warn!(
                "Could not validate access to service '{}', monitoring anyway",
                service_name
            );
            false
        }
        Err(e) => {
            warn!(
                "Access check for service '{}' failed: {:#}. Monitoring anyway",
                service_name, e
            );
            false
        }
    }
}
