//! Credential apply targets
//!
//! A target is the system where the service account's credentials must be
//! enacted whenever the credentials record changes:
//! - Databases (PostgreSQL)
//! - APIs (REST APIs that manage user passwords)
//! - A simulated target for hosts with nothing real to update

mod api;
mod postgres;
mod simulated;
mod target;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;

pub use api::ApiTarget;
pub use postgres::PostgresTarget;
pub use simulated::SimulatedTarget;
pub use target::Target;

/// Shared handle to the configured target
pub type TargetInstance = Arc<dyn Target>;

/// Create the target selected by configuration.
///
/// `[targets.postgres]` wins over `[targets.api]`, which wins over
/// `[targets.simulated]`. With no target configured a simulated target that
/// always succeeds is used.
pub async fn create_target(config: &Config) -> Result<TargetInstance> {
    let service_name = &config.monitor.target_service_name;

    if let Some(ref targets) = config.targets {
        if let Some(ref postgres_config) = targets.postgres {
            let admin_password = PostgresTarget::admin_password(postgres_config)
                .context("Failed to create PostgreSQL target")?;
            return Ok(Arc::new(PostgresTarget::new(postgres_config, &admin_password)));
        }

        if let Some(ref api_config) = targets.api {
            let target = ApiTarget::new(api_config).context("Failed to create API target")?;
            return Ok(Arc::new(target));
        }

        if let Some(ref simulated_config) = targets.simulated {
            return Ok(Arc::new(SimulatedTarget::new(
                service_name.clone(),
                simulated_config,
            )));
        }
    }

    warn!(
        "No target configured for service '{}', credential updates will be simulated",
        service_name
    );
    Ok(Arc::new(SimulatedTarget::always_succeeding(
        service_name.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimulatedTargetConfig, TargetsConfig};

    #[tokio::test]
    async fn test_default_target_is_simulated() {
        let target = create_target(&Config::default()).await.unwrap();
        assert_eq!(target.target_type(), "simulated");
    }

    #[tokio::test]
    async fn test_unreachable_postgres_is_not_fatal() {
        let config = Config {
            targets: Some(TargetsConfig {
                postgres: Some(crate::config::PostgresTargetConfig {
                    host: "127.0.0.1".to_string(),
                    port: 9,
                    database: "postgres".to_string(),
                    username: "admin".to_string(),
                    password: Some("adminpw".to_string()),
                    password_env: None,
                    ssl_mode: "disable".to_string(),
                }),
                api: None,
                simulated: None,
            }),
            ..Default::default()
        };

        let target = create_target(&config).await.unwrap();
        assert_eq!(target.target_type(), "postgres");
        assert!(!target.validate_access().await.unwrap());
    }

    #[tokio::test]
    async fn test_api_target_preferred_over_simulated() {
        let config = Config {
            targets: Some(TargetsConfig {
                api: Some(crate::config::ApiTargetConfig {
                    base_url: "https://api.example.com".to_string(),
                    endpoint: "/password".to_string(),
                    method: "POST".to_string(),
                    password_field: "password".to_string(),
                    username_field: None,
                    additional_fields: None,
                    auth_header: None,
                    headers: None,
                    health_endpoint: None,
                    timeout_seconds: 5,
                }),
                simulated: Some(SimulatedTargetConfig::default()),
                postgres: None,
            }),
            ..Default::default()
        };

        let target = create_target(&config).await.unwrap();
        assert_eq!(target.target_type(), "api");
    }
}
