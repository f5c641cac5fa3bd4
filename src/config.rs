use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<TargetsConfig>,
}

/// Settings for watching the credentials record and driving updates.
///
/// Keys are snake_case; the PascalCase names used by older deployments are
/// accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_credentials_file_path", alias = "CredentialsFilePath")]
    pub credentials_file_path: PathBuf,
    #[serde(default = "default_target_service_name", alias = "TargetServiceName")]
    pub target_service_name: String,
    /// Liveness tick, not the debounce window
    #[serde(default = "default_check_interval", alias = "CheckIntervalSeconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_retry_attempts", alias = "MaxRetryAttempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay", alias = "RetryDelaySeconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_quiet_window")]
    pub quiet_window_millis: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_millis: u64,
    #[serde(default = "default_true")]
    pub apply_on_startup: bool,
    #[serde(default = "default_true")]
    pub create_placeholder: bool,
    #[serde(default = "default_placeholder_secret_length")]
    pub placeholder_secret_length: usize,
}

fn default_credentials_file_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_target_service_name() -> String {
    "Sample Service".to_string()
}

fn default_check_interval() -> u64 {
    30
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_quiet_window() -> u64 {
    1000
}

fn default_settle_delay() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_placeholder_secret_length() -> usize {
    32
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            credentials_file_path: default_credentials_file_path(),
            target_service_name: default_target_service_name(),
            check_interval_seconds: default_check_interval(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_seconds: default_retry_delay(),
            quiet_window_millis: default_quiet_window(),
            settle_delay_millis: default_settle_delay(),
            apply_on_startup: true,
            create_placeholder: true,
            placeholder_secret_length: default_placeholder_secret_length(),
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_millis)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresTargetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiTargetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated: Option<SimulatedTargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresTargetConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_postgres_database")]
    pub database: String,
    /// Admin role used to alter the service account
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Environment variable holding the admin password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "postgres".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTargetConfig {
    pub base_url: String,
    pub endpoint: String,
    #[serde(default = "default_api_method")]
    pub method: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_fields: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Endpoint probed by `validate_access`; skipped when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_seconds: u64,
}

fn default_api_method() -> String {
    "POST".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTargetConfig {
    /// Probability in `[0, 1]` that an apply call succeeds
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_latency")]
    pub latency_millis: u64,
}

fn default_success_rate() -> f64 {
    0.8
}

fn default_latency() -> u64 {
    1000
}

impl Default for SimulatedTargetConfig {
    fn default() -> Self {
        Self {
            success_rate: default_success_rate(),
            latency_millis: default_latency(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config file")
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables fall back to defaults; set but unparsable numbers are errors.
    pub fn from_env() -> Result<Self> {
        let mut monitor = MonitorConfig::default();

        if let Ok(path) = std::env::var("CREDENTIALS_FILE_PATH") {
            monitor.credentials_file_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var("TARGET_SERVICE_NAME") {
            monitor.target_service_name = name;
        }
        if let Some(value) = env_number("CHECK_INTERVAL_SECONDS")? {
            monitor.check_interval_seconds = value;
        }
        if let Some(value) = env_number("MAX_RETRY_ATTEMPTS")? {
            monitor.max_retry_attempts = value;
        }
        if let Some(value) = env_number("RETRY_DELAY_SECONDS")? {
            monitor.retry_delay_seconds = value;
        }

        Ok(Self {
            monitor,
            targets: None,
        })
    }

    /// Reject settings the monitor cannot run with
    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        if monitor.credentials_file_path.as_os_str().is_empty() {
            anyhow::bail!("credentials_file_path must not be empty");
        }
        if monitor.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be at least 1");
        }
        if monitor.check_interval_seconds == 0 {
            anyhow::bail!("check_interval_seconds must be at least 1");
        }
        if let Some(simulated) = self.targets.as_ref().and_then(|t| t.simulated.as_ref()) {
            if !(0.0..=1.0).contains(&simulated.success_rate) {
                anyhow::bail!(
                    "targets.simulated.success_rate must be between 0 and 1, got {}",
                    simulated.success_rate
                );
            }
        }
        Ok(())
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample = Self {
            monitor: MonitorConfig::default(),
            targets: Some(TargetsConfig {
                postgres: None,
                api: None,
                simulated: Some(SimulatedTargetConfig::default()),
            }),
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        let monitor = &config.monitor;

        assert_eq!(monitor.credentials_file_path, PathBuf::from("credentials.json"));
        assert_eq!(monitor.target_service_name, "Sample Service");
        assert_eq!(monitor.check_interval_seconds, 30);
        assert_eq!(monitor.max_retry_attempts, 3);
        assert_eq!(monitor.retry_delay_seconds, 5);
        assert_eq!(monitor.quiet_window(), Duration::from_secs(1));
        assert_eq!(monitor.settle_delay(), Duration::from_millis(500));
        assert!(config.targets.is_none());
    }

    #[test]
    fn test_pascal_case_aliases() {
        let config = Config::from_toml_str(
            r#"
            [monitor]
            CredentialsFilePath = "/etc/svc/creds.json"
            TargetServiceName = "Billing"
            CheckIntervalSeconds = 10
            MaxRetryAttempts = 5
            RetryDelaySeconds = 2
            "#,
        )
        .unwrap();

        assert_eq!(
            config.monitor.credentials_file_path,
            PathBuf::from("/etc/svc/creds.json")
        );
        assert_eq!(config.monitor.target_service_name, "Billing");
        assert_eq!(config.monitor.check_interval_seconds, 10);
        assert_eq!(config.monitor.max_retry_attempts, 5);
        assert_eq!(config.monitor.retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_targets_section() {
        let config = Config::from_toml_str(
            r#"
            [targets.api]
            base_url = "https://api.example.com"
            endpoint = "/users/{username}/password"
            "#,
        )
        .unwrap();

        let api = config.targets.unwrap().api.unwrap();
        assert_eq!(api.method, "POST");
        assert_eq!(api.password_field, "password");
        assert_eq!(api.timeout_seconds, 30);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.monitor.max_retry_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_success_rate() {
        let mut config = Config::default();
        config.targets = Some(TargetsConfig {
            simulated: Some(SimulatedTargetConfig {
                success_rate: 1.5,
                latency_millis: 0,
            }),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_round_trips() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("rotator-config.toml");

        Config::create_sample(&path)?;
        let config = Config::from_file(&path)?;

        assert_eq!(config.monitor.max_retry_attempts, 3);
        assert!(config.targets.unwrap().simulated.is_some());
        Ok(())
    }
}
