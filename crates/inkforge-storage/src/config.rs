//! Storage configuration
//!
//! Backend selection comes from `DATABASE_TYPE` (`memory`, `embedded`,
//! `network`), with environment-based defaults: dev -> embedded,
//! test -> memory, prod -> network.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::file::EmbeddedTaskStore;
use crate::memory::InMemoryTaskStore;
use crate::postgres::PostgresTaskStore;
use crate::store::{StoreError, TaskStore};

/// Selected storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Memory,
    Embedded,
    Network,
}

impl std::str::FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "embedded" => Ok(Self::Embedded),
            "network" => Ok(Self::Network),
            other => Err(format!("unknown database type: {other}")),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: DatabaseKind,
    /// Backing file for the embedded backend
    pub embedded_path: PathBuf,
    /// Connection string for the network backend
    pub database_url: Option<String>,
}

impl StorageConfig {
    /// In-memory config (tests)
    pub fn memory() -> Self {
        Self {
            kind: DatabaseKind::Memory,
            embedded_path: PathBuf::from("inkforge.db.json"),
            database_url: None,
        }
    }

    /// Read configuration from the environment
    ///
    /// `DATABASE_TYPE` wins; otherwise `APP_ENV` picks the default backend.
    pub fn from_env() -> Result<Self, StoreError> {
        let kind = match std::env::var("DATABASE_TYPE") {
            Ok(v) => v
                .parse()
                .map_err(StoreError::Serialization)?,
            Err(_) => match std::env::var("APP_ENV").as_deref() {
                Ok("test") => DatabaseKind::Memory,
                Ok("prod") | Ok("production") => DatabaseKind::Network,
                _ => DatabaseKind::Embedded,
            },
        };

        Ok(Self {
            kind,
            embedded_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("inkforge.db.json")),
            database_url: std::env::var("DATABASE_URL").ok(),
        })
    }
}

/// Open the configured backend
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    match config.kind {
        DatabaseKind::Memory => {
            info!("using in-memory task store");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
        DatabaseKind::Embedded => {
            info!(path = %config.embedded_path.display(), "using embedded task store");
            Ok(Arc::new(
                EmbeddedTaskStore::open(&config.embedded_path).await?,
            ))
        }
        DatabaseKind::Network => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                StoreError::Database(
                    "DATABASE_URL is required for the network backend".to_string(),
                )
            })?;
            info!("using postgres task store");
            Ok(Arc::new(PostgresTaskStore::connect(url).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("memory".parse::<DatabaseKind>().unwrap(), DatabaseKind::Memory);
        assert_eq!(
            "embedded".parse::<DatabaseKind>().unwrap(),
            DatabaseKind::Embedded
        );
        assert_eq!(
            "network".parse::<DatabaseKind>().unwrap(),
            DatabaseKind::Network
        );
        assert!("redis".parse::<DatabaseKind>().is_err());
    }

    #[tokio::test]
    async fn test_memory_connect() {
        let store = connect(&StorageConfig::memory()).await.unwrap();
        assert_eq!(
            store
                .count(crate::models::TaskFilter::default())
                .await
                .unwrap(),
            0
        );
    }
}
