//! Load settings from the environment and the tenant schema from JSON.

use crate::config::schema::SchemaDefinition;
use crate::config::types::*;
use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

fn env_parse<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn env_list(key: &'static str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

impl TenancySettings {
    /// Read `SONICUS_*` variables. `SONICUS_MASTER_DATABASE_URL` falls back to `DATABASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let master_database_url = std::env::var("SONICUS_MASTER_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgres://localhost/sonicus".into());

        let defaults = PoolSettings::default();
        let pool = PoolSettings {
            pool_size: env_parse("SONICUS_DB_POOL_SIZE", defaults.pool_size)?,
            max_overflow: env_parse("SONICUS_DB_MAX_OVERFLOW", defaults.max_overflow)?,
            connect_timeout_secs: env_parse("SONICUS_DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs)?,
            recycle_secs: env_parse("SONICUS_DB_POOL_RECYCLE_SECS", defaults.recycle_secs)?,
            idle_timeout_secs: env_parse("SONICUS_DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
        };
        if pool.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SONICUS_DB_POOL_SIZE",
                message: "must be at least 1".into(),
            });
        }

        let health_defaults = HealthThresholds::default();
        let health = HealthThresholds {
            slow_ms: env_parse("SONICUS_HEALTH_SLOW_MS", health_defaults.slow_ms)?,
            high_utilization: env_parse("SONICUS_HEALTH_UTILIZATION", health_defaults.high_utilization)?,
        };
        if !(0.0..=1.0).contains(&health.high_utilization) {
            return Err(ConfigError::Invalid {
                key: "SONICUS_HEALTH_UTILIZATION",
                message: "must be between 0 and 1".into(),
            });
        }

        let host_defaults = HostSettings::default();
        let host = HostSettings {
            base_domains: env_list("SONICUS_BASE_DOMAINS").unwrap_or(host_defaults.base_domains),
            reserved_subdomains: env_list("SONICUS_RESERVED_SUBDOMAINS")
                .unwrap_or(host_defaults.reserved_subdomains),
        };

        Ok(TenancySettings {
            master_database_url,
            admin_database: std::env::var("SONICUS_ADMIN_DATABASE").unwrap_or_else(|_| "postgres".into()),
            pool,
            health,
            host,
            pg_dump_path: std::env::var("SONICUS_PG_DUMP")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("pg_dump")),
            tenant_schema_path: std::env::var("SONICUS_TENANT_SCHEMA_PATH").ok().map(PathBuf::from),
        })
    }

    /// Tenant schema from `tenant_schema_path` when set, otherwise the built-in one.
    pub async fn tenant_schema(&self) -> Result<SchemaDefinition, ConfigError> {
        match &self.tenant_schema_path {
            Some(path) => load_schema_from_path(path).await,
            None => Ok(SchemaDefinition::platform_default()),
        }
    }
}

/// Load and validate a JSON tenant schema file.
pub async fn load_schema_from_path(path: &Path) -> Result<SchemaDefinition, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Schema(format!("{}: {}", path.display(), e)))?;
    let schema: SchemaDefinition =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Schema(format!("{}: {}", path.display(), e)))?;
    schema.validate()?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_file_is_loaded_and_validated() {
        let dir = std::env::temp_dir().join(format!("sonicus-schema-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("schema.json");
        let schema = SchemaDefinition::platform_default();
        tokio::fs::write(&path, serde_json::to_string(&schema).unwrap())
            .await
            .unwrap();

        let loaded = load_schema_from_path(&path).await.unwrap();
        assert_eq!(loaded.tables.len(), schema.tables.len());

        tokio::fs::write(&path, r#"{"tables": [{"name": "t", "columns": [], "primary_key": ["id"]}]}"#)
            .await
            .unwrap();
        assert!(load_schema_from_path(&path).await.is_err());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_schema_file_is_a_schema_error() {
        let err = load_schema_from_path(Path::new("/nonexistent/sonicus/schema.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }
}
