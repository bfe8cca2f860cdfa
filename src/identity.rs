//! Tenant identities and the catalog entities the tenancy layer reasons about.

use crate::error::ResolutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Which physical database a unit of work is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TenantIdentity {
    /// Platform-wide catalog database (super admins, resolution lookups).
    Master,
    /// One database per organization.
    Organization(Uuid),
    /// Pre-multi-tenant accounts with one database per user.
    LegacyUser(i64),
}

impl TenantIdentity {
    /// Stable cache/log key: `master`, `org:<uuid>` or `user:<id>`.
    pub fn key(&self) -> String {
        match self {
            TenantIdentity::Master => "master".to_string(),
            TenantIdentity::Organization(id) => format!("org:{}", id),
            TenantIdentity::LegacyUser(id) => format!("user:{}", id),
        }
    }

    pub fn organization_id(&self) -> Option<Uuid> {
        match self {
            TenantIdentity::Organization(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, TenantIdentity::Master)
    }
}

impl fmt::Display for TenantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for TenantIdentity {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("master") {
            return Ok(TenantIdentity::Master);
        }
        if let Some(rest) = s.strip_prefix("org:") {
            return Uuid::parse_str(rest)
                .map(TenantIdentity::Organization)
                .map_err(|_| ResolutionError::InvalidTenantKey(s.to_string()));
        }
        if let Some(rest) = s.strip_prefix("user:") {
            return rest
                .parse::<i64>()
                .map(TenantIdentity::LegacyUser)
                .map_err(|_| ResolutionError::InvalidTenantKey(s.to_string()));
        }
        Err(ResolutionError::InvalidTenantKey(s.to_string()))
    }
}

/// Platform role of an authenticated user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    SuperAdmin,
    BusinessAdmin,
    Staff,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::SuperAdmin => "super_admin",
            UserRole::BusinessAdmin => "business_admin",
            UserRole::Staff => "staff",
            UserRole::User => "user",
        }
    }
}

impl FromStr for UserRole {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "super_admin" => Ok(UserRole::SuperAdmin),
            "business_admin" => Ok(UserRole::BusinessAdmin),
            "staff" => Ok(UserRole::Staff),
            "user" => Ok(UserRole::User),
            other => Err(ResolutionError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    /// Trial and paying organizations receive traffic; suspended and cancelled do not.
    pub fn is_routable(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(ResolutionError::UnknownSubscriptionStatus(other.to_string())),
        }
    }
}

/// Organization row from the master catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Subdomain label under one of the platform base domains (e.g. `acme`).
    pub domain: Option<String>,
    /// Fully qualified host owned by the customer (e.g. `sounds.acme.com`).
    pub custom_domain: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub database_created: bool,
    pub database_created_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn identity(&self) -> TenantIdentity {
        TenantIdentity::Organization(self.id)
    }

    pub fn summary(&self) -> OrganizationSummary {
        OrganizationSummary {
            id: self.id,
            name: self.name.clone(),
            domain: self.domain.clone(),
            custom_domain: self.custom_domain.clone(),
            subscription_status: self.subscription_status,
        }
    }
}

/// Denormalized organization view handed to downstream authorization checks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSummary {
    pub id: Uuid,
    pub name: String,
    pub domain: Option<String>,
    pub custom_domain: Option<String>,
    pub subscription_status: SubscriptionStatus,
}

/// Already-authenticated user as handed over by the auth layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Integer user id from the master catalog.
    pub id: Option<i64>,
    pub role: UserRole,
    pub organization_id: Option<Uuid>,
    /// Identity from the pre-organization sign-up flow.
    pub firebase_uid: Option<String>,
}

impl Principal {
    pub fn new(id: i64, role: UserRole) -> Self {
        Principal {
            id: Some(id),
            role,
            organization_id: None,
            firebase_uid: None,
        }
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_firebase_uid(mut self, uid: impl Into<String>) -> Self {
        self.firebase_uid = Some(uid.into());
        self
    }

    pub fn has_legacy_identity(&self) -> bool {
        self.firebase_uid
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }
}
