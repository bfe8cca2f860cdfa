//! Runtime settings for the tenancy layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Subdomain labels that belong to the platform itself and never name an organization.
pub const DEFAULT_RESERVED_SUBDOMAINS: &[&str] =
    &["www", "api", "admin", "app", "dashboard", "static", "cdn"];

pub const DEFAULT_BASE_DOMAIN: &str = "sonicus.eu";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenancySettings {
    /// Connection URL of the master catalog database. Tenant URLs are derived from it.
    pub master_database_url: String,
    /// Bootstrap database used for CREATE DATABASE.
    #[serde(default = "default_admin_database")]
    pub admin_database: String,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub health: HealthThresholds,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default = "default_pg_dump")]
    pub pg_dump_path: PathBuf,
    /// JSON file overriding the built-in tenant schema.
    #[serde(default)]
    pub tenant_schema_path: Option<PathBuf>,
}

impl TenancySettings {
    pub fn new(master_database_url: impl Into<String>) -> Self {
        TenancySettings {
            master_database_url: master_database_url.into(),
            admin_database: default_admin_database(),
            pool: PoolSettings::default(),
            health: HealthThresholds::default(),
            host: HostSettings::default(),
            pg_dump_path: default_pg_dump(),
            tenant_schema_path: None,
        }
    }
}

fn default_admin_database() -> String {
    "postgres".into()
}

fn default_pg_dump() -> PathBuf {
    PathBuf::from("pg_dump")
}

/// Per-tenant pool sizing. Each tenant engine gets its own pool with these bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub connect_timeout_secs: u64,
    /// Connections older than this are closed and replaced.
    pub recycle_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            pool_size: 5,
            max_overflow: 10,
            connect_timeout_secs: 10,
            recycle_secs: 3600,
            idle_timeout_secs: 600,
        }
    }
}

impl PoolSettings {
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow).max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub slow_ms: u64,
    /// Fraction of the pool checked out above which a tenant is reported as high utilization.
    pub high_utilization: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        HealthThresholds {
            slow_ms: 1000,
            high_utilization: 0.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    pub base_domains: Vec<String>,
    pub reserved_subdomains: Vec<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        HostSettings {
            base_domains: vec![DEFAULT_BASE_DOMAIN.to_string()],
            reserved_subdomains: DEFAULT_RESERVED_SUBDOMAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl HostSettings {
    pub fn is_reserved(&self, label: &str) -> bool {
        self.reserved_subdomains
            .iter()
            .any(|r| r.eq_ignore_ascii_case(label))
    }
}
