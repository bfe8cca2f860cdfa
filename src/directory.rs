//! Organization lookups against the master catalog, and the catalog DDL.

use crate::error::TenancyError;
use crate::identity::{Organization, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[async_trait]
pub trait OrganizationDirectory: Send + Sync + 'static {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Organization>, TenancyError>;

    /// Exact match on `custom_domain` (already normalized host).
    async fn find_by_custom_domain(&self, host: &str) -> Result<Option<Organization>, TenancyError>;

    /// Exact match on the `domain` subdomain label.
    async fn find_by_subdomain(&self, label: &str) -> Result<Option<Organization>, TenancyError>;

    /// Flip `database_created` from false to true and stamp `database_created_at`.
    /// Returns false when the flag was already set (timestamp left untouched).
    async fn mark_database_created(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, TenancyError>;
}

/// Create the master catalog tables the directory reads if they do not exist.
pub async fn ensure_catalog_tables(pool: &PgPool) -> Result<(), TenancyError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            domain TEXT UNIQUE,
            custom_domain TEXT UNIQUE,
            subscription_status TEXT NOT NULL DEFAULT 'trial',
            database_created BOOLEAN NOT NULL DEFAULT FALSE,
            database_created_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL DEFAULT 'user',
            organization_id UUID REFERENCES organizations (id) ON DELETE SET NULL,
            firebase_uid TEXT UNIQUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_organization_id ON users (organization_id)")
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    domain: Option<String>,
    custom_domain: Option<String>,
    subscription_status: String,
    database_created: bool,
    database_created_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = TenancyError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        let subscription_status: SubscriptionStatus = row.subscription_status.parse()?;
        Ok(Organization {
            id: row.id,
            name: row.name,
            domain: row.domain,
            custom_domain: row.custom_domain,
            subscription_status,
            database_created: row.database_created,
            database_created_at: row.database_created_at,
        })
    }
}

const ORGANIZATION_COLUMNS: &str =
    "id, name, domain, custom_domain, subscription_status, database_created, database_created_at";

#[derive(Clone)]
pub struct PgOrganizationDirectory {
    pool: PgPool,
}

impl PgOrganizationDirectory {
    pub fn new(pool: PgPool) -> Self {
        PgOrganizationDirectory { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<Organization>, TenancyError> {
        let sql = format!(
            "SELECT {} FROM organizations WHERE lower({}) = lower($1) LIMIT 1",
            ORGANIZATION_COLUMNS, column
        );
        let row: Option<OrganizationRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organization::try_from).transpose()
    }

    /// Insert a catalog row. Registration owns this in production; tooling and tests use it directly.
    pub async fn insert(&self, org: &Organization) -> Result<(), TenancyError> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, domain, custom_domain, subscription_status, database_created, database_created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.domain)
        .bind(&org.custom_domain)
        .bind(org.subscription_status.as_str())
        .bind(org.database_created)
        .bind(org.database_created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OrganizationDirectory for PgOrganizationDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Organization>, TenancyError> {
        let sql = format!("SELECT {} FROM organizations WHERE id = $1", ORGANIZATION_COLUMNS);
        let row: Option<OrganizationRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organization::try_from).transpose()
    }

    async fn find_by_custom_domain(&self, host: &str) -> Result<Option<Organization>, TenancyError> {
        self.find_one("custom_domain", host).await
    }

    async fn find_by_subdomain(&self, label: &str) -> Result<Option<Organization>, TenancyError> {
        self.find_one("domain", label).await
    }

    async fn mark_database_created(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, TenancyError> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET database_created = TRUE, database_created_at = $2, updated_at = NOW()
            WHERE id = $1 AND database_created = FALSE
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
