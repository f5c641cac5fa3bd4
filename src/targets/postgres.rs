use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::config::PostgresTargetConfig;
use crate::record::CredentialRecord;
use crate::targets::target::Target;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL role whose password is kept in sync with the credentials record
pub struct PostgresTarget {
    config: Arc<PostgresTargetConfig>,
    admin_password: String,
    /// Admin session, opened on first use and replaced once it closes
    admin_client: Mutex<Option<Client>>,
}

impl PostgresTarget {
    /// The admin connection is opened lazily, so an unreachable server at
    /// startup is not fatal.
    pub fn new(config: &PostgresTargetConfig, admin_password: &str) -> Self {
        info!(
            "Using PostgreSQL at {}:{} as credentials target",
            config.host, config.port
        );

        Self {
            config: Arc::new(config.clone()),
            admin_password: admin_password.to_string(),
            admin_client: Mutex::new(None),
        }
    }

    /// Resolve the admin password from the config or the named environment variable
    pub fn admin_password(config: &PostgresTargetConfig) -> Result<String> {
        if let Some(ref var) = config.password_env {
            return std::env::var(var)
                .with_context(|| format!("{} environment variable not set", var));
        }
        config.password.clone().ok_or_else(|| {
            anyhow::anyhow!("PostgreSQL admin password not configured. Set password or password_env")
        })
    }

    /// Build PostgreSQL connection string
    fn build_connection_string(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        ssl_mode: &str,
    ) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode={} connect_timeout={}",
            host,
            port,
            Self::quote_value(username),
            Self::quote_value(password),
            database,
            ssl_mode,
            CONNECT_TIMEOUT.as_secs()
        )
    }

    /// Quote a connection-string value so spaces and quotes survive
    fn quote_value(value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }

    /// Quote PostgreSQL identifier to prevent SQL injection
    fn quote_identifier(identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Open a connection and drive it in the background
    async fn connect(connection_string: &str) -> Result<Client, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection closed: {}", describe(&e));
            }
        });

        Ok(client)
    }

    /// Run `sql` on the admin session, reconnecting first if it has closed
    async fn admin_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        let mut guard = self.admin_client.lock().await;

        let client = match guard.take() {
            Some(client) if !client.is_closed() => client,
            stale => {
                if stale.is_some() {
                    info!("PostgreSQL admin connection closed, reconnecting");
                }
                let connection_string = Self::build_connection_string(
                    &self.config.host,
                    self.config.port,
                    &self.config.username,
                    &self.admin_password,
                    &self.config.database,
                    &self.config.ssl_mode,
                );
                Self::connect(&connection_string).await?
            }
        };

        let result = client.batch_execute(sql).await;
        *guard = Some(client);
        result
    }

    /// Log in with the new credentials to confirm they took effect
    async fn verify_login(&self, record: &CredentialRecord) -> Result<(), tokio_postgres::Error> {
        let connection_string = Self::build_connection_string(
            &self.config.host,
            self.config.port,
            record.username(),
            record.secret(),
            &self.config.database,
            &self.config.ssl_mode,
        );

        let test_client = Self::connect(&connection_string).await?;
        test_client.query_one("SELECT 1", &[]).await.map(|_| ())
    }
}

/// Describe a driver error without the server's message, which can quote the role name
fn describe(e: &tokio_postgres::Error) -> String {
    if let Some(code) = e.code() {
        return format!("SQLSTATE {}", code.code());
    }
    if let Some(io) = std::error::Error::source(e).and_then(|s| s.downcast_ref::<std::io::Error>())
    {
        return format!("I/O error: {}", io);
    }
    if e.is_closed() {
        "connection closed".to_string()
    } else {
        "unexpected PostgreSQL error".to_string()
    }
}

#[async_trait::async_trait]
impl Target for PostgresTarget {
    async fn validate_access(&self) -> Result<bool> {
        match self.admin_execute("SELECT 1").await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("PostgreSQL admin connection check failed: {}", describe(&e));
                Ok(false)
            }
        }
    }

    async fn apply_credentials(&self, record: &CredentialRecord) -> Result<bool> {
        let masked = record.masked_username();
        info!("Updating password for PostgreSQL user: {}", masked);

        let escaped_password = record.secret().replace('\'', "''");
        let query = format!(
            "ALTER USER {} WITH PASSWORD '{}'",
            Self::quote_identifier(record.username()),
            escaped_password
        );

        debug!("Executing: ALTER USER {} WITH PASSWORD '***'", masked);

        self.admin_execute(&query).await.map_err(|e| {
            anyhow!(
                "Failed to update PostgreSQL password for {}: {}",
                masked,
                describe(&e)
            )
        })?;

        self.verify_login(record).await.map_err(|e| {
            anyhow!(
                "Failed to verify new password for {}: {}",
                masked,
                describe(&e)
            )
        })?;

        info!("Successfully updated password for user: {}", masked);
        Ok(true)
    }

    fn target_type(&self) -> &'static str {
        "postgres"
    }
}
