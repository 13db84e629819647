//! Configuration management
//!
//! Everything is read from the environment (after `dotenvy` has loaded any
//! `.env` file); command-line flags override individual values afterwards.

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::error::IngestError;

// ============================================================================
// Run Configuration Constants
// ============================================================================

/// Default number of concurrent document workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Default number of documents selected per scanner page.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default capacity of the worker-to-drain queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of row-sets the drain task takes per wake-up.
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 32;

/// Default per-document processing budget in seconds.
pub const DEFAULT_DOCUMENT_TIMEOUT_SECS: u64 = 30;

/// Default staging table holding the raw payloads.
pub const DEFAULT_STAGING_TABLE: &str = "app_xml";

/// Default staging id column.
pub const DEFAULT_STAGING_ID_COLUMN: &str = "app_id";

/// Default staging payload column.
pub const DEFAULT_STAGING_PAYLOAD_COLUMN: &str = "xml";

/// Default processing ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "processing_log";

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/docload";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Connections kept beyond one per worker, for the drain task and ledger
/// writes outside a unit of work.
pub const POOL_HEADROOM: u32 = 2;

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, IngestError> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::Config(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Pipeline sizing and document range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub drain_batch_size: usize,
    pub document_timeout_secs: u64,
    /// First document id to consider, inclusive
    pub range_start: Option<i64>,
    /// Last document id to consider, inclusive
    pub range_end: Option<i64>,
    pub max_documents: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            document_timeout_secs: DEFAULT_DOCUMENT_TIMEOUT_SECS,
            range_start: None,
            range_end: None,
            max_documents: None,
        }
    }
}

impl RunConfig {
    /// Load from `DOCLOAD_*` variables, falling back to defaults
    pub fn from_env() -> Result<Self, IngestError> {
        let defaults = Self::default();
        Ok(Self {
            workers: env_parse("DOCLOAD_WORKERS")?.unwrap_or(defaults.workers),
            batch_size: env_parse("DOCLOAD_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            queue_capacity: env_parse("DOCLOAD_QUEUE_CAPACITY")?.unwrap_or(defaults.queue_capacity),
            drain_batch_size: env_parse("DOCLOAD_DRAIN_BATCH_SIZE")?
                .unwrap_or(defaults.drain_batch_size),
            document_timeout_secs: env_parse("DOCLOAD_DOCUMENT_TIMEOUT_SECS")?
                .unwrap_or(defaults.document_timeout_secs),
            range_start: env_parse("DOCLOAD_RANGE_START")?,
            range_end: env_parse("DOCLOAD_RANGE_END")?,
            max_documents: env_parse("DOCLOAD_MAX_DOCUMENTS")?,
        })
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.workers == 0 {
            return Err(IngestError::Config("workers must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch_size must be greater than 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(IngestError::Config(
                "drain_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.document_timeout_secs == 0 {
            return Err(IngestError::Config(
                "document_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
            if start > end {
                return Err(IngestError::Config(format!(
                    "range_start ({start}) cannot be greater than range_end ({end})"
                )));
            }
        }
        Ok(())
    }

    pub fn document_timeout(&self) -> Duration {
        Duration::from_secs(self.document_timeout_secs)
    }

    /// Connections needed so every worker and the drain task can hold a
    /// unit of work at once
    pub fn required_connections(&self) -> u32 {
        u32::try_from(self.workers)
            .unwrap_or(u32::MAX)
            .saturating_add(POOL_HEADROOM)
    }
}

/// Staging and ledger locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Possibly schema-qualified, e.g. `staging.app_xml`
    pub staging_table: String,
    pub staging_id_column: String,
    pub staging_payload_column: String,
    /// Possibly schema-qualified
    pub ledger_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            staging_table: DEFAULT_STAGING_TABLE.to_string(),
            staging_id_column: DEFAULT_STAGING_ID_COLUMN.to_string(),
            staging_payload_column: DEFAULT_STAGING_PAYLOAD_COLUMN.to_string(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            staging_table: env_string("DOCLOAD_STAGING_TABLE").unwrap_or(defaults.staging_table),
            staging_id_column: env_string("DOCLOAD_STAGING_ID_COLUMN")
                .unwrap_or(defaults.staging_id_column),
            staging_payload_column: env_string("DOCLOAD_STAGING_PAYLOAD_COLUMN")
                .unwrap_or(defaults.staging_payload_column),
            ledger_table: env_string("DOCLOAD_LEDGER_TABLE").unwrap_or(defaults.ledger_table),
        }
    }

    /// Names are interpolated into SQL, so only plain identifiers pass
    pub fn validate(&self) -> Result<(), IngestError> {
        let qualified = |what: &str, name: &str| -> Result<(), IngestError> {
            let parts: Vec<&str> = name.split('.').collect();
            if parts.len() > 2 || !parts.iter().all(|p| crate::contract::is_identifier(p)) {
                return Err(IngestError::Config(format!("{what} '{name}' is not a valid table name")));
            }
            Ok(())
        };
        let plain = |what: &str, name: &str| -> Result<(), IngestError> {
            if crate::contract::is_identifier(name) {
                Ok(())
            } else {
                Err(IngestError::Config(format!("{what} '{name}' is not a valid column name")))
            }
        };

        qualified("staging table", &self.staging_table)?;
        qualified("ledger table", &self.ledger_table)?;
        plain("staging id column", &self.staging_id_column)?;
        plain("staging payload column", &self.staging_payload_column)?;
        Ok(())
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            max_lifetime_secs: None,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        let url = env_string("DATABASE_URL")
            .ok_or_else(|| IngestError::Config("DATABASE_URL not set".to_string()))?;
        let defaults = Self::default();

        Ok(Self {
            url,
            max_connections: env_parse("DB_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            min_connections: env_parse("DB_MIN_CONNECTIONS")?.unwrap_or(defaults.min_connections),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT")?
                .unwrap_or(defaults.connect_timeout_secs),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT")?.or(defaults.idle_timeout_secs),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME")?,
        })
    }

    /// Grow the pool so it can serve `required` concurrent units of work
    pub fn sized_for(mut self, required: u32) -> Self {
        self.max_connections = self.max_connections.max(required);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.url.is_empty() {
            return Err(IngestError::Config("Database URL cannot be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(IngestError::Config(
                "Database max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(IngestError::Config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool, IngestError> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

    if let Some(idle_timeout) = config.idle_timeout_secs {
        options = options.idle_timeout(Duration::from_secs(idle_timeout));
    }

    if let Some(max_lifetime) = config.max_lifetime_secs {
        options = options.max_lifetime(Duration::from_secs(max_lifetime));
    }

    let pool = options
        .connect(&config.url)
        .await
        .map_err(|e| IngestError::Store(e.into()))?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "DOCLOAD_WORKERS",
            "DOCLOAD_BATCH_SIZE",
            "DOCLOAD_RANGE_START",
            "DOCLOAD_RANGE_END",
            "DOCLOAD_LEDGER_TABLE",
            "DATABASE_URL",
            "DB_MAX_CONNECTIONS",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_default_run_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.document_timeout(), Duration::from_secs(30));
        assert_eq!(config.required_connections(), 10);
    }

    #[test]
    fn test_run_config_validation() {
        let zero_workers = RunConfig {
            workers: 0,
            ..RunConfig::default()
        };
        assert!(zero_workers.validate().is_err());

        let inverted = RunConfig {
            range_start: Some(10),
            range_end: Some(5),
            ..RunConfig::default()
        };
        assert!(matches!(inverted.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_run_config_from_env() {
        clear_env();
        std::env::set_var("DOCLOAD_WORKERS", "3");
        std::env::set_var("DOCLOAD_RANGE_END", "5000");

        let config = RunConfig::from_env().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.range_end, Some(5000));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);

        std::env::set_var("DOCLOAD_BATCH_SIZE", "lots");
        assert!(RunConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_db_config_from_env() {
        clear_env();
        assert!(DbConfig::from_env().is_err());

        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("DB_MAX_CONNECTIONS", "4");
        let config = DbConfig::from_env().unwrap();
        assert_eq!(config.max_connections, 4);

        let sized = config.sized_for(RunConfig::default().required_connections());
        assert_eq!(sized.max_connections, 10);
        assert!(sized.validate().is_ok());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_store_config_validation() {
        clear_env();
        std::env::set_var("DOCLOAD_LEDGER_TABLE", "ops.processing_log");
        let config = StoreConfig::from_env();
        assert_eq!(config.ledger_table, "ops.processing_log");
        assert!(config.validate().is_ok());

        let bad = StoreConfig {
            staging_table: "app_xml; DROP TABLE x".to_string(),
            ..StoreConfig::default()
        };
        assert!(bad.validate().is_err());
        clear_env();
    }
}
