//! Sonicus tenancy: per-organization database routing, provisioning and isolation.
//!
//! Every organization gets its own PostgreSQL database; legacy accounts keep one database per
//! user; super admins and catalog lookups use the master database. [`SessionBroker`] is the
//! entry point for business code.

pub mod broker;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fake;
pub mod handlers;
pub mod identity;
pub mod locks;
pub mod maintenance;
pub mod middleware;
pub mod migration;
pub mod naming;
pub mod provisioner;
pub mod registry;
pub mod resolver;
pub mod response;
pub mod routes;
pub mod state;

pub use broker::{ScopedSession, SessionBroker, SessionOf};
pub use config::{HealthThresholds, HostSettings, PoolSettings, SchemaDefinition, TenancySettings};
pub use directory::{ensure_catalog_tables, OrganizationDirectory, PgOrganizationDirectory};
pub use engine::{Connector, Engine, PgConnector, PgEngine, PoolStats, Session};
pub use error::{ConfigError, ResolutionError, TenancyError};
pub use identity::{Organization, OrganizationSummary, Principal, SubscriptionStatus, TenantIdentity, UserRole};
pub use maintenance::{BackupReport, DumpTarget, HealthReport, HealthStatus, Maintenance};
pub use middleware::{current_tenant, resolve_tenant, CurrentTenant, OrganizationTenant};
pub use naming::{database_name_for, legacy_user_database_name, organization_database_name};
pub use provisioner::{PgProvisioningBackend, ProvisionOutcome, Provisioner, ProvisioningBackend, ProvisioningStatus};
pub use registry::ConnectionRegistry;
pub use resolver::{resolve_principal, require_tenant, HostResolver, Resolution, RoutingReason, TenantContext, TenantMode};
pub use routes::{admin_routes, common_routes, common_routes_with_ready};
pub use state::TenancyState;
