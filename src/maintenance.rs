//! Tenant health checks, engine recycling and backups.

use crate::broker::SessionBroker;
use crate::config::{HealthThresholds, TenancySettings};
use crate::directory::OrganizationDirectory;
use crate::engine::{Connector, Engine, PoolStats};
use crate::error::{ResolutionError, TenancyError};
use crate::identity::TenantIdentity;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use url::Url;

const DEFAULT_PG_PORT: u16 = 5432;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Slow,
    HighUtilization,
    Unhealthy,
    /// The organization exists but its database has not been provisioned yet.
    NotProvisioned,
}

impl HealthStatus {
    /// Whether the tenant can serve traffic right now.
    pub fn is_available(self) -> bool {
        !matches!(self, HealthStatus::Unhealthy | HealthStatus::NotProvisioned)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub tenant: String,
    pub database: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub pool_utilization: f64,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackupReport {
    pub tenant: String,
    pub database: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Where `pg_dump` lives and how to reach the server.
#[derive(Clone, Debug)]
pub struct BackupSettings {
    pub pg_dump: PathBuf,
    pub master_database_url: String,
}

impl BackupSettings {
    pub fn from_settings(settings: &TenancySettings) -> Self {
        BackupSettings {
            pg_dump: settings.pg_dump_path.clone(),
            master_database_url: settings.master_database_url.clone(),
        }
    }
}

/// Connection parameters handed to `pg_dump`. The password goes through `PGPASSWORD`, so it
/// never shows up in the process list.
#[derive(Clone, PartialEq, Eq)]
pub struct DumpTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    password: Option<String>,
    pub database: String,
    pub ssl_mode: Option<String>,
}

impl std::fmt::Debug for DumpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

fn decoded(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

impl DumpTarget {
    /// Server and credentials from the master URL, pointed at `database`.
    pub fn from_master_url(master_url: &str, database: &str) -> Result<Self, TenancyError> {
        let url = Url::parse(master_url)
            .map_err(|e| TenancyError::Backup(format!("invalid master database url: {}", e)))?;
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
            .to_string();
        let username = Some(url.username()).filter(|u| !u.is_empty()).map(decoded);
        let password = url.password().map(decoded);
        let ssl_mode = url
            .query_pairs()
            .find(|(key, _)| key == "sslmode")
            .map(|(_, value)| value.into_owned());
        Ok(DumpTarget {
            host,
            port: url.port().unwrap_or(DEFAULT_PG_PORT),
            username,
            password,
            database: database.to_string(),
            ssl_mode,
        })
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Connection arguments for `pg_dump`; credentials are not among them.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if let Some(username) = &self.username {
            args.push("--username".to_string());
            args.push(username.clone());
        }
        args.push("--dbname".to_string());
        args.push(self.database.clone());
        args
    }

    fn apply_env(&self, command: &mut tokio::process::Command) {
        command.env_remove("PGPASSWORD");
        if let Some(password) = &self.password {
            command.env("PGPASSWORD", password);
        }
        if let Some(mode) = &self.ssl_mode {
            command.env("PGSSLMODE", mode);
        }
    }
}

pub fn classify(elapsed_ms: u64, utilization: f64, thresholds: &HealthThresholds) -> HealthStatus {
    if elapsed_ms > thresholds.slow_ms {
        HealthStatus::Slow
    } else if utilization > thresholds.high_utilization {
        HealthStatus::HighUtilization
    } else {
        HealthStatus::Healthy
    }
}

pub struct Maintenance<C: Connector> {
    broker: SessionBroker<C>,
    thresholds: HealthThresholds,
    backup: BackupSettings,
}

impl<C: Connector> Maintenance<C> {
    pub fn new(broker: SessionBroker<C>, thresholds: HealthThresholds, backup: BackupSettings) -> Self {
        Maintenance {
            broker,
            thresholds,
            backup,
        }
    }

    pub fn broker(&self) -> &SessionBroker<C> {
        &self.broker
    }

    /// Round trip against the tenant's engine. Connection failures produce an `unhealthy`
    /// report; an organization without a database is reported as `not_provisioned` and left
    /// alone. An unknown tenant is an error.
    pub async fn health_check(&self, identity: &TenantIdentity) -> Result<HealthReport, TenancyError> {
        let database = self.broker.registry().database_name(identity);
        let started = Instant::now();
        let unreached = |status: HealthStatus, error: Option<String>| HealthReport {
            tenant: identity.key(),
            database: database.clone(),
            status,
            response_time_ms: started.elapsed().as_millis() as u64,
            pool_utilization: 0.0,
            pool: PoolStats::default(),
            error,
        };

        if let TenantIdentity::Organization(id) = identity {
            if !self.broker.registry().contains(identity) {
                match self.broker.directory().find_by_id(*id).await {
                    Ok(Some(org)) if !org.database_created => {
                        tracing::info!(tenant = %identity, "health check skipped, database not provisioned");
                        return Ok(unreached(HealthStatus::NotProvisioned, None));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => return Err(ResolutionError::OrganizationNotFound(id.to_string()).into()),
                    Err(e) => {
                        tracing::warn!(tenant = %identity, error = %e, "health check could not read the catalog");
                        return Ok(unreached(HealthStatus::Unhealthy, Some(e.to_string())));
                    }
                }
            }
        }

        let engine = match self.broker.engine_for(identity).await {
            Ok(engine) => engine,
            Err(e @ TenancyError::Resolution(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(tenant = %identity, error = %e, "health check could not reach tenant");
                return Ok(unreached(HealthStatus::Unhealthy, Some(e.to_string())));
            }
        };

        let started = Instant::now();
        let ping = engine.ping().await;
        let response_time_ms = started.elapsed().as_millis() as u64;
        let pool = engine.stats();
        let pool_utilization = pool.utilization();
        let (status, error) = match ping {
            Ok(()) => (classify(response_time_ms, pool_utilization, &self.thresholds), None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };
        match status {
            HealthStatus::Healthy | HealthStatus::NotProvisioned => {}
            HealthStatus::Unhealthy => {
                tracing::warn!(tenant = %identity, error = ?error, "tenant unhealthy")
            }
            _ => tracing::warn!(
                tenant = %identity,
                response_time_ms,
                pool_utilization,
                status = ?status,
                "tenant degraded"
            ),
        }
        Ok(HealthReport {
            tenant: identity.key(),
            database,
            status,
            response_time_ms,
            pool_utilization,
            pool,
            error,
        })
    }

    /// Dispose the cached engine and build a fresh one. Returns whether an engine was cached.
    pub async fn invalidate_and_recreate(&self, identity: &TenantIdentity) -> Result<bool, TenancyError> {
        let disposed = self.broker.registry().invalidate(identity).await;
        let engine = self.broker.engine_for(identity).await?;
        tracing::info!(
            tenant = %identity,
            disposed,
            instance = engine.instance_id(),
            "engine recreated"
        );
        Ok(disposed)
    }

    /// Dump the tenant database to `path` in `pg_dump` custom format.
    pub async fn backup(&self, identity: &TenantIdentity, path: &Path) -> Result<BackupReport, TenancyError> {
        let database = self.broker.registry().database_name(identity);
        let target = DumpTarget::from_master_url(&self.backup.master_database_url, &database)?;
        let started = Instant::now();
        tracing::info!(
            tenant = %identity,
            database = %database,
            host = %target.host,
            path = %path.display(),
            "backup started"
        );

        let mut command = tokio::process::Command::new(&self.backup.pg_dump);
        command
            .arg("--format=custom")
            .arg("--no-owner")
            .arg("--no-password")
            .arg("--file")
            .arg(path)
            .args(target.args())
            .kill_on_drop(true);
        target.apply_env(&mut command);
        let output = command
            .output()
            .await
            .map_err(|e| TenancyError::Backup(format!("{}: {}", self.backup.pg_dump.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(tenant = %identity, status = ?output.status.code(), "backup failed");
            return Err(TenancyError::Backup(stderr));
        }
        let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(tenant = %identity, bytes, elapsed_ms, "backup finished");
        Ok(BackupReport {
            tenant: identity.key(),
            database,
            path: path.to_path_buf(),
            bytes,
            elapsed_ms,
        })
    }
}
