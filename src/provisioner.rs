//! Tenant database provisioning: create database, apply schema, seed defaults, mark ready.
//!
//! Every step is idempotent, so a failed run is simply retried on the next access. The
//! organization's `database_created` flag is set only after all steps succeed, and only here.

use crate::config::SchemaDefinition;
use crate::directory::OrganizationDirectory;
use crate::engine::PgConnector;
use crate::error::{ResolutionError, TenancyError};
use crate::identity::{Organization, TenantIdentity};
use crate::locks::KeyedLocks;
use crate::migration;
use crate::naming::{database_name_for, quote_ident};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{ConnectOptions, Connection, PgConnection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use uuid::Uuid;

/// PostgreSQL `duplicate_database`.
const PG_DUPLICATE_DATABASE: &str = "42P04";
/// Concurrent CREATE DATABASE for one name can surface as a catalog unique violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Physical operations the provisioner orchestrates. Database names are already computed.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync + 'static {
    async fn database_exists(&self, database: &str) -> Result<bool, TenancyError>;
    /// Returns false when the database already existed, including when a concurrent creator won.
    async fn create_database(&self, database: &str) -> Result<bool, TenancyError>;
    /// Returns the number of DDL statements applied.
    async fn apply_schema(&self, database: &str) -> Result<usize, TenancyError>;
    /// Returns the number of rows actually inserted.
    async fn seed_defaults(&self, database: &str) -> Result<u64, TenancyError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseCreation {
    Created,
    AlreadyExisted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    AlreadyProvisioned,
    Provisioned {
        database: String,
        creation: DatabaseCreation,
        statements: usize,
        seeded_rows: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisioningStatus {
    pub organization_id: Uuid,
    pub database_name: String,
    pub database_created: bool,
    pub database_created_at: Option<DateTime<Utc>>,
    pub database_exists: bool,
}

pub struct Provisioner {
    backend: Arc<dyn ProvisioningBackend>,
    directory: Arc<dyn OrganizationDirectory>,
    master_database: String,
    locks: KeyedLocks<TenantIdentity>,
    /// Legacy users whose database was fully prepared by this process.
    prepared_users: Mutex<HashSet<i64>>,
}

fn step_failed(identity: &TenantIdentity, step: &str, err: TenancyError) -> TenancyError {
    match err {
        e @ TenancyError::Provisioning { .. } => e,
        e => TenancyError::provisioning(identity, format!("{}: {}", step, e)),
    }
}

impl Provisioner {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        directory: Arc<dyn OrganizationDirectory>,
        master_database: impl Into<String>,
    ) -> Self {
        Provisioner {
            backend,
            directory,
            master_database: master_database.into(),
            locks: KeyedLocks::new(),
            prepared_users: Mutex::new(HashSet::new()),
        }
    }

    pub fn database_name(&self, identity: &TenantIdentity) -> String {
        database_name_for(identity, &self.master_database)
    }

    fn tenant_database(&self, identity: &TenantIdentity) -> Result<String, TenancyError> {
        if identity.is_master() {
            return Err(TenancyError::provisioning(
                identity,
                "the master catalog does not receive the tenant schema",
            ));
        }
        Ok(self.database_name(identity))
    }

    /// Create the tenant's database if it is missing. Concurrent callers for one tenant are
    /// serialized; a lost creation race counts as already existing.
    pub async fn ensure_database_exists(&self, identity: &TenantIdentity) -> Result<DatabaseCreation, TenancyError> {
        let _guard = self.locks.acquire(identity).await;
        self.ensure_database_exists_locked(identity).await
    }

    async fn ensure_database_exists_locked(&self, identity: &TenantIdentity) -> Result<DatabaseCreation, TenancyError> {
        let database = self.database_name(identity);
        if self.backend.database_exists(&database).await? {
            return Ok(DatabaseCreation::AlreadyExisted);
        }
        if self.backend.create_database(&database).await? {
            tracing::info!(tenant = %identity, database = %database, "database created");
            Ok(DatabaseCreation::Created)
        } else {
            tracing::debug!(tenant = %identity, database = %database, "database appeared concurrently");
            Ok(DatabaseCreation::AlreadyExisted)
        }
    }

    pub async fn apply_schema(&self, identity: &TenantIdentity) -> Result<usize, TenancyError> {
        let database = self.tenant_database(identity)?;
        self.backend.apply_schema(&database).await
    }

    pub async fn seed_defaults(&self, identity: &TenantIdentity) -> Result<u64, TenancyError> {
        let database = self.tenant_database(identity)?;
        self.backend.seed_defaults(&database).await
    }

    /// Bring an organization's database to ready and flip `database_created`. Returns false on
    /// failure after logging; callers treat that as retry-later.
    pub async fn provision(&self, organization: &Organization, force: bool) -> bool {
        match self.try_provision(organization, force).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    tenant = %organization.identity(),
                    error = %e,
                    "provisioning failed, will retry on next access"
                );
                false
            }
        }
    }

    /// [`provision`](Self::provision) with the failure cause. Without `force`, an organization
    /// already flagged as created returns immediately without any I/O.
    pub async fn try_provision(&self, organization: &Organization, force: bool) -> Result<ProvisionOutcome, TenancyError> {
        if organization.database_created && !force {
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        let identity = organization.identity();
        let _guard = self.locks.acquire(&identity).await;

        // Another caller may have finished while we waited for the lock.
        if !force {
            let current = self
                .directory
                .find_by_id(organization.id)
                .await?
                .ok_or_else(|| ResolutionError::OrganizationNotFound(organization.id.to_string()))?;
            if current.database_created {
                return Ok(ProvisionOutcome::AlreadyProvisioned);
            }
        }

        let started = Instant::now();
        let database = self.database_name(&identity);
        tracing::info!(tenant = %identity, database = %database, force, "provisioning organization database");

        let creation = self
            .ensure_database_exists_locked(&identity)
            .await
            .map_err(|e| step_failed(&identity, "create database", e))?;
        let statements = self
            .backend
            .apply_schema(&database)
            .await
            .map_err(|e| step_failed(&identity, "apply schema", e))?;
        let seeded_rows = self
            .backend
            .seed_defaults(&database)
            .await
            .map_err(|e| step_failed(&identity, "seed defaults", e))?;
        let flipped = self
            .directory
            .mark_database_created(organization.id, Utc::now())
            .await
            .map_err(|e| step_failed(&identity, "mark database created", e))?;

        tracing::info!(
            tenant = %identity,
            database = %database,
            statements,
            seeded_rows,
            flipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "organization database ready"
        );
        Ok(ProvisionOutcome::Provisioned {
            database,
            creation,
            statements,
            seeded_rows,
        })
    }

    /// Legacy per-user databases carry no readiness flag; every step is idempotent, so they are
    /// prepared once per process on first access.
    pub async fn prepare_legacy_user(&self, user_id: i64) -> Result<ProvisionOutcome, TenancyError> {
        let identity = TenantIdentity::LegacyUser(user_id);
        if self.is_prepared(user_id) {
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        let _guard = self.locks.acquire(&identity).await;
        if self.is_prepared(user_id) {
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        let database = self.database_name(&identity);
        let creation = self
            .ensure_database_exists_locked(&identity)
            .await
            .map_err(|e| step_failed(&identity, "create database", e))?;
        let statements = self
            .backend
            .apply_schema(&database)
            .await
            .map_err(|e| step_failed(&identity, "apply schema", e))?;
        let seeded_rows = self
            .backend
            .seed_defaults(&database)
            .await
            .map_err(|e| step_failed(&identity, "seed defaults", e))?;
        self.prepared_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id);
        tracing::info!(tenant = %identity, database = %database, statements, seeded_rows, "legacy user database ready");
        Ok(ProvisionOutcome::Provisioned {
            database,
            creation,
            statements,
            seeded_rows,
        })
    }

    fn is_prepared(&self, user_id: i64) -> bool {
        self.prepared_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&user_id)
    }

    pub async fn status(&self, organization_id: Uuid) -> Result<ProvisioningStatus, TenancyError> {
        let org = self
            .directory
            .find_by_id(organization_id)
            .await?
            .ok_or_else(|| ResolutionError::OrganizationNotFound(organization_id.to_string()))?;
        let database_name = self.database_name(&org.identity());
        let database_exists = self.backend.database_exists(&database_name).await?;
        Ok(ProvisioningStatus {
            organization_id,
            database_name,
            database_created: org.database_created,
            database_created_at: org.database_created_at,
            database_exists,
        })
    }
}

/// Provisioning against a real PostgreSQL server. CREATE DATABASE runs on a short-lived
/// connection to the bootstrap database; schema and seeds run on a short-lived connection to
/// the tenant database, outside the tenant's pool.
pub struct PgProvisioningBackend {
    connector: PgConnector,
    schema: Arc<SchemaDefinition>,
}

impl PgProvisioningBackend {
    pub fn new(connector: PgConnector, schema: SchemaDefinition) -> Self {
        PgProvisioningBackend {
            connector,
            schema: Arc::new(schema),
        }
    }

    async fn tenant_connection(&self, database: &str) -> Result<PgConnection, TenancyError> {
        let opts = self.connector.options_for(database);
        match tokio::time::timeout(self.connector.connect_timeout(), opts.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(TenancyError::connection(database, e)),
            Err(_) => Err(TenancyError::connection(database, "connect timed out")),
        }
    }
}

fn is_duplicate_database(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == PG_DUPLICATE_DATABASE || code == PG_UNIQUE_VIOLATION)
        .unwrap_or(false)
}

#[async_trait]
impl ProvisioningBackend for PgProvisioningBackend {
    async fn database_exists(&self, database: &str) -> Result<bool, TenancyError> {
        let mut conn = self.connector.admin_connection().await?;
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(&mut conn)
            .await?;
        let _ = conn.close().await;
        Ok(exists.0)
    }

    async fn create_database(&self, database: &str) -> Result<bool, TenancyError> {
        let mut conn = self.connector.admin_connection().await?;
        let result = sqlx::query(&format!("CREATE DATABASE {}", quote_ident(database)))
            .execute(&mut conn)
            .await;
        let _ = conn.close().await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_database(&e) => Ok(false),
            Err(e) => Err(TenancyError::Db(e)),
        }
    }

    async fn apply_schema(&self, database: &str) -> Result<usize, TenancyError> {
        let mut conn = self.tenant_connection(database).await?;
        let applied = migration::apply_schema(&mut conn, &self.schema).await;
        let _ = conn.close().await;
        applied
    }

    async fn seed_defaults(&self, database: &str) -> Result<u64, TenancyError> {
        let mut conn = self.tenant_connection(database).await?;
        let seeded = migration::seed_defaults(&mut conn, &self.schema).await;
        let _ = conn.close().await;
        seeded
    }
}
