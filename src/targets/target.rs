use anyhow::Result;

use crate::record::CredentialRecord;

/// Trait for systems the service account credentials are applied to
/// (databases, APIs, applications, etc.)
///
/// Implementations make no idempotence or atomicity promise. Callers only get
/// a per-call success or failure, and the coordinator never issues two calls
/// concurrently.
#[async_trait::async_trait]
pub trait Target: Send + Sync {
    /// Best-effort check that the target is reachable with the configured access
    async fn validate_access(&self) -> Result<bool>;

    /// Apply the credentials to the target account.
    ///
    /// `Ok(false)` and `Err(_)` both count as a failed attempt. Errors must not
    /// carry the secret.
    async fn apply_credentials(&self, record: &CredentialRecord) -> Result<bool>;

    /// Get the target type name for display purposes
    fn target_type(&self) -> &'static str;
}
