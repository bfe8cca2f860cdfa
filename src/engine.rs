//! Engine, session and connector seams, with the PostgreSQL implementations.
//!
//! An engine is a connection pool bound to one physical database; it doubles as the session
//! factory, each `begin` yielding an independent transaction.

use crate::config::{PoolSettings, TenancySettings};
use crate::error::TenancyError;
use crate::identity::TenantIdentity;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgConnection, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_ENGINE_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a newly built engine.
pub fn next_engine_instance() -> u64 {
    NEXT_ENGINE_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Base pool size; connections beyond it count as overflow.
    pub pool_size: u32,
    pub checked_out: u32,
    pub idle: u32,
    pub overflow: u32,
}

impl PoolStats {
    /// Checked-out connections over base pool size.
    pub fn utilization(&self) -> f64 {
        if self.pool_size == 0 {
            return 0.0;
        }
        f64::from(self.checked_out) / f64::from(self.pool_size)
    }
}

/// A unit of work on one tenant database.
#[async_trait]
pub trait Session: Send + 'static {
    async fn commit(self) -> Result<(), TenancyError>;
    async fn rollback(self) -> Result<(), TenancyError>;
}

#[async_trait]
pub trait Engine: Clone + Send + Sync + 'static {
    type Session: Session;

    fn database(&self) -> &str;
    /// Process-unique id; two handles with the same id share one pool.
    fn instance_id(&self) -> u64;
    async fn begin(&self) -> Result<Self::Session, TenancyError>;
    /// Trivial round trip on a pooled connection.
    async fn ping(&self) -> Result<(), TenancyError>;
    fn stats(&self) -> PoolStats;
    /// Close every pooled connection. Handles still held elsewhere stop handing out sessions.
    async fn dispose(&self);
}

/// Builds engines. Implementations must not cache; caching belongs to the registry.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Engine: Engine;

    fn master_database(&self) -> &str;
    async fn connect(&self, identity: &TenantIdentity, database: &str) -> Result<Self::Engine, TenancyError>;
}

#[async_trait]
impl Session for Transaction<'static, Postgres> {
    async fn commit(self) -> Result<(), TenancyError> {
        Transaction::commit(self).await.map_err(TenancyError::Db)
    }

    async fn rollback(self) -> Result<(), TenancyError> {
        Transaction::rollback(self).await.map_err(TenancyError::Db)
    }
}

#[derive(Clone)]
pub struct PgEngine {
    pool: PgPool,
    database: Arc<str>,
    pool_size: u32,
    instance: u64,
}

impl PgEngine {
    pub fn new(pool: PgPool, database: &str, pool_size: u32) -> Self {
        PgEngine {
            pool,
            database: Arc::from(database),
            pool_size,
            instance: next_engine_instance(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Engine for PgEngine {
    type Session = Transaction<'static, Postgres>;

    fn database(&self) -> &str {
        &self.database
    }

    fn instance_id(&self) -> u64 {
        self.instance
    }

    async fn begin(&self) -> Result<Self::Session, TenancyError> {
        self.pool
            .begin()
            .await
            .map_err(|e| TenancyError::connection(&self.database, e))
    }

    async fn ping(&self) -> Result<(), TenancyError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| TenancyError::connection(&self.database, e))
    }

    fn stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(size);
        PoolStats {
            pool_size: self.pool_size,
            checked_out: size - idle,
            idle,
            overflow: size.saturating_sub(self.pool_size),
        }
    }

    async fn dispose(&self) {
        self.pool.close().await;
    }
}

/// Builds one bounded pool per tenant database from the master connection URL.
#[derive(Clone, Debug)]
pub struct PgConnector {
    base: PgConnectOptions,
    master_database: String,
    admin_database: String,
    pool: PoolSettings,
}

impl PgConnector {
    pub fn from_settings(settings: &TenancySettings) -> Result<Self, TenancyError> {
        let base = PgConnectOptions::from_str(&settings.master_database_url).map_err(|e| {
            crate::error::ConfigError::Invalid {
                key: "SONICUS_MASTER_DATABASE_URL",
                message: e.to_string(),
            }
        })?;
        let master_database = base.get_database().unwrap_or("postgres").to_string();
        Ok(PgConnector {
            base,
            master_database,
            admin_database: settings.admin_database.clone(),
            pool: settings.pool.clone(),
        })
    }

    pub fn options_for(&self, database: &str) -> PgConnectOptions {
        self.base.clone().database(database)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.pool.connect_timeout()
    }

    /// Single short-lived connection to the bootstrap database, for CREATE DATABASE.
    pub async fn admin_connection(&self) -> Result<PgConnection, TenancyError> {
        let opts = self.options_for(&self.admin_database);
        match tokio::time::timeout(self.connect_timeout(), opts.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(TenancyError::connection(&self.admin_database, e)),
            Err(_) => Err(TenancyError::connection(&self.admin_database, "connect timed out")),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Engine = PgEngine;

    fn master_database(&self) -> &str {
        &self.master_database
    }

    async fn connect(&self, identity: &TenantIdentity, database: &str) -> Result<PgEngine, TenancyError> {
        let options = PgPoolOptions::new()
            .max_connections(self.pool.max_connections())
            .min_connections(0)
            .acquire_timeout(self.connect_timeout())
            .idle_timeout(Some(Duration::from_secs(self.pool.idle_timeout_secs)))
            .max_lifetime(Some(Duration::from_secs(self.pool.recycle_secs)))
            .test_before_acquire(true);
        let connect = options.connect_with(self.options_for(database));
        let pool = match tokio::time::timeout(self.connect_timeout(), connect).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => return Err(TenancyError::connection(identity, e)),
            Err(_) => return Err(TenancyError::connection(identity, "connect timed out")),
        };
        Ok(PgEngine::new(pool, database, self.pool.pool_size))
    }
}
