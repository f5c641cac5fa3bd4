use anyhow::Result;
use rand::Rng;
use std::time::Duration;
use tracing::info;

use crate::config::SimulatedTargetConfig;
use crate::record::CredentialRecord;
use crate::targets::target::Target;

/// Stand-in target for hosts without a real account backend.
///
/// Each apply waits for the configured latency and then succeeds with the
/// configured probability.
pub struct SimulatedTarget {
    service_name: String,
    success_rate: f64,
    latency: Duration,
}

impl SimulatedTarget {
    pub fn new(service_name: impl Into<String>, config: &SimulatedTargetConfig) -> Self {
        Self {
            service_name: service_name.into(),
            success_rate: config.success_rate.clamp(0.0, 1.0),
            latency: Duration::from_millis(config.latency_millis),
        }
    }

    /// A simulated target whose applies always succeed immediately
    pub fn always_succeeding(service_name: impl Into<String>) -> Self {
        Self::new(
            service_name,
            &SimulatedTargetConfig {
                success_rate: 1.0,
                latency_millis: 0,
            },
        )
    }
}

#[async_trait::async_trait]
impl Target for SimulatedTarget {
    async fn validate_access(&self) -> Result<bool> {
        info!("Simulated access check for service '{}'", self.service_name);
        Ok(true)
    }

    async fn apply_credentials(&self, record: &CredentialRecord) -> Result<bool> {
        info!(
            "Simulating credential update for service '{}' (user: {})",
            self.service_name,
            record.masked_username()
        );

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        Ok(rand::thread_rng().gen_bool(self.success_rate))
    }

    fn target_type(&self) -> &'static str {
        "simulated"
    }
}
