use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// How long startup waits for the first connection before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to one Redis logical database.
///
/// `ConnectionManager` reconnects on its own after a dropped connection, so a
/// pool is cheap to clone and share between request handlers.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    database: i64,
    addr_label: String,
}

impl RedisPool {
    /// Connect to `redis_url`, selecting `database` instead of whatever
    /// database the URL names.
    pub async fn connect(redis_url: &str, database: i64) -> Result<Self> {
        Self::connect_with_timeout(redis_url, database, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        redis_url: &str,
        database: i64,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let info = connection_info_for_database(redis_url, database)?;
        let addr_label = info.addr.to_string();

        let client = Client::open(info).context("failed to construct Redis client")?;
        let manager = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .with_context(|| {
                format!(
                    "timed out after {:?} connecting to Redis at {}",
                    connect_timeout, addr_label
                )
            })?
            .context("failed to initialize Redis connection manager")?;

        info!(addr = %addr_label, database, "Redis connection established");

        Ok(Self {
            manager,
            database,
            addr_label,
        })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    pub fn addr_label(&self) -> &str {
        &self.addr_label
    }
}

/// Parse a Redis URL and override its logical database.
pub fn connection_info_for_database(redis_url: &str, database: i64) -> Result<ConnectionInfo> {
    let mut info: ConnectionInfo = redis_url
        .into_connection_info()
        .context("failed to parse REDIS_URL connection string")?;
    info.redis.db = database;
    Ok(info)
}

/// Build `redis://host:port` from separate host and port settings.
pub fn redis_url_from_parts(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.starts_with("redis://") || host.starts_with("rediss://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("redis://{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_override() {
        let info = connection_info_for_database("redis://localhost:6379/0", 3).unwrap();
        assert_eq!(info.redis.db, 3);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(connection_info_for_database("not a url", 1).is_err());
    }

    #[test]
    fn test_url_from_parts() {
        assert_eq!(redis_url_from_parts("redis", 6379), "redis://redis:6379");
        assert_eq!(
            redis_url_from_parts("rediss://cache.internal", 6380),
            "rediss://cache.internal:6380"
        );
    }
}
