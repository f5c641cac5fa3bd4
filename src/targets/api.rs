use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ApiTargetConfig;
use crate::record::CredentialRecord;
use crate::targets::target::Target;

/// API-based target for password updates via REST API
pub struct ApiTarget {
    config: Arc<ApiTargetConfig>,
    client: Client,
}

impl ApiTarget {
    /// Create a new ApiTarget
    pub fn new(config: &ApiTargetConfig) -> Result<Self> {
        info!("Creating API target for: {}", config.base_url);

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config: Arc::new(config.clone()),
            client,
        })
    }

    /// Resolve an endpoint against the base URL, filling the `{username}` placeholder
    pub(crate) fn build_url(&self, endpoint: &str, username: &str) -> String {
        let url = endpoint.replace("{username}", username);

        if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    fn method(&self) -> reqwest::Method {
        match self.config.method.to_uppercase().as_str() {
            "GET" => reqwest::Method::GET,
            "PUT" => reqwest::Method::PUT,
            "PATCH" => reqwest::Method::PATCH,
            "DELETE" => reqwest::Method::DELETE,
            _ => reqwest::Method::POST,
        }
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref auth_header) = self.config.auth_header {
            request = request.header("Authorization", auth_header);
        }
        if let Some(ref headers) = self.config.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        request
    }

    fn request_body(&self, record: &CredentialRecord) -> serde_json::Value {
        let mut body = json!({});

        if let Some(ref username_field) = self.config.username_field {
            body[username_field] = json!(record.username());
        }
        body[&self.config.password_field] = json!(record.secret());

        if let Some(ref additional_fields) = self.config.additional_fields {
            for (key, value) in additional_fields {
                body[key] = json!(value);
            }
        }
        body
    }
}

#[async_trait::async_trait]
impl Target for ApiTarget {
    async fn validate_access(&self) -> Result<bool> {
        let Some(ref health) = self.config.health_endpoint else {
            debug!("No health endpoint configured, skipping access check");
            return Ok(true);
        };

        let url = self.build_url(health, "");
        let response = self
            .with_headers(self.client.get(&url))
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to reach API health endpoint")?;

        let status = response.status();
        if !status.is_success() {
            warn!("API health endpoint returned status {}", status);
        }
        Ok(status.is_success())
    }

    async fn apply_credentials(&self, record: &CredentialRecord) -> Result<bool> {
        let masked = record.masked_username();
        info!("Updating password via API for user: {}", masked);
        debug!(
            "Calling API endpoint: {}",
            self.build_url(&self.config.endpoint, &masked)
        );

        let url = self.build_url(&self.config.endpoint, record.username());
        let request = self
            .with_headers(self.client.request(self.method(), &url))
            .json(&self.request_body(record));

        // The URL can carry the raw username
        let response = request
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to send API request for {}", masked))?;

        // Only the status is reported; the body may echo the submitted credentials
        let status = response.status();
        if !status.is_success() {
            warn!("API request for {} failed with status {}", masked, status);
            return Ok(false);
        }

        info!("Successfully updated password via API for user: {}", masked);
        Ok(true)
    }

    fn target_type(&self) -> &'static str {
        "api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockito::Matcher;

    fn config(base_url: &str, endpoint: &str) -> ApiTargetConfig {
        ApiTargetConfig {
            base_url: base_url.to_string(),
            endpoint: endpoint.to_string(),
            method: "POST".to_string(),
            password_field: "password".to_string(),
            username_field: Some("username".to_string()),
            additional_fields: None,
            auth_header: None,
            headers: None,
            health_endpoint: None,
            timeout_seconds: 30,
        }
    }

    #[test]
    fn test_build_url_with_placeholder() {
        let target =
            ApiTarget::new(&config("https://api.example.com", "/users/{username}/password"))
                .unwrap();

        let url = target.build_url(&target.config.endpoint, "testuser");
        assert_eq!(url, "https://api.example.com/users/testuser/password");
    }

    #[test]
    fn test_build_url_with_full_url() {
        let target =
            ApiTarget::new(&config("https://api.example.com", "https://other.com/api/password"))
                .unwrap();

        let url = target.build_url(&target.config.endpoint, "testuser");
        assert_eq!(url, "https://other.com/api/password");
    }

    #[test]
    fn test_build_url_with_trailing_slash() {
        let target = ApiTarget::new(&config("https://api.example.com/", "/password")).unwrap();

        let url = target.build_url(&target.config.endpoint, "testuser");
        assert_eq!(url, "https://api.example.com/password");
    }

    #[tokio::test]
    async fn test_apply_posts_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/users/alice/password")
            .match_header("authorization", "Bearer admin-token")
            .match_body(Matcher::Json(json!({
                "username": "alice",
                "password": "s3cret",
            })))
            .with_status(204)
            .create_async()
            .await;

        let mut cfg = config(&server.url(), "/users/{username}/password");
        cfg.auth_header = Some("Bearer admin-token".to_string());
        let target = ApiTarget::new(&cfg).unwrap();

        let record = CredentialRecord::new("alice", "s3cret", Utc::now());
        assert!(target.apply_credentials(&record).await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_apply_reports_failure_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/password")
            .with_status(500)
            .with_body("could not set password s3cret")
            .create_async()
            .await;

        let target = ApiTarget::new(&config(&server.url(), "/password")).unwrap();
        let record = CredentialRecord::new("alice", "s3cret", Utc::now());

        assert!(!target.apply_credentials(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_error_masks_username() {
        // Nothing listens on port 9, so the request fails before any response
        let target =
            ApiTarget::new(&config("http://127.0.0.1:9", "/users/{username}/password")).unwrap();
        let record = CredentialRecord::new("alice", "s3cret", Utc::now());

        let err = target.apply_credentials(&record).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("ali**"));
        assert!(!message.contains("alice"));
        assert!(!message.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_validate_access_uses_health_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let mut cfg = config(&server.url(), "/password");
        assert!(ApiTarget::new(&cfg).unwrap().validate_access().await.unwrap());

        cfg.health_endpoint = Some("/health".to_string());
        assert!(!ApiTarget::new(&cfg).unwrap().validate_access().await.unwrap());
    }
}
