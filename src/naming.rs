//! Physical database naming. This is the only place tenant database names are computed.

use crate::identity::TenantIdentity;
use uuid::Uuid;

pub const ORGANIZATION_DB_PREFIX: &str = "sonicus_org_";
pub const LEGACY_USER_DB_PREFIX: &str = "sonicus_user_";

/// `sonicus_org_<uuid with hyphens replaced by underscores>`.
pub fn organization_database_name(organization_id: &Uuid) -> String {
    format!(
        "{}{}",
        ORGANIZATION_DB_PREFIX,
        organization_id.hyphenated().to_string().replace('-', "_")
    )
}

/// `sonicus_user_<user_id>`.
pub fn legacy_user_database_name(user_id: i64) -> String {
    format!("{}{}", LEGACY_USER_DB_PREFIX, user_id)
}

/// Database name for any identity. `Master` maps to the configured master database.
pub fn database_name_for(identity: &TenantIdentity, master_database: &str) -> String {
    match identity {
        TenantIdentity::Master => master_database.to_string(),
        TenantIdentity::Organization(id) => organization_database_name(id),
        TenantIdentity::LegacyUser(id) => legacy_user_database_name(*id),
    }
}

/// Double-quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
