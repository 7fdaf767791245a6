use crate::domain::{DomainError, DomainResult};
use clickhouse::Client;
use tracing::info;

/// Where the time-series store lives.
#[derive(Debug, Clone)]
pub struct ClickHouseSettings {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Handle shared by the sink and the aggregate reader. Cloning is cheap.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    database: String,
}

impl ClickHouseClient {
    pub fn new(settings: &ClickHouseSettings) -> Self {
        let client = Client::default()
            .with_url(&settings.url)
            .with_database(&settings.database)
            .with_user(&settings.username)
            .with_password(&settings.password)
            .with_compression(clickhouse::Compression::Lz4);

        Self {
            client,
            database: settings.database.clone(),
        }
    }

    /// Fails fast at startup if the server is unreachable. Returns the
    /// server version.
    pub async fn ping(&self) -> DomainResult<String> {
        let version = self
            .client
            .query("SELECT version()")
            .fetch_one::<String>()
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow::anyhow!("ClickHouse unreachable: {}", e))
            })?;

        info!(version = %version, database = %self.database, "connected to ClickHouse");
        Ok(version)
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}
