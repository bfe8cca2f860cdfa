//! Tenant resolution.
//!
//! The primary path maps an authenticated principal to a [`TenantIdentity`] without I/O.
//! The host path maps request metadata (tenant header, `Host`) to an organization through the
//! master catalog and feeds the HTTP middleware.

use crate::config::HostSettings;
use crate::directory::OrganizationDirectory;
use crate::error::{ResolutionError, TenancyError};
use crate::identity::{Organization, OrganizationSummary, Principal, TenantIdentity, UserRole};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Why a principal was routed where it was.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    SuperAdmin,
    OrganizationMember,
    LegacyAccount,
    /// No usable identity; routed to master as a last resort.
    NoIdentityFallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub identity: TenantIdentity,
    pub reason: RoutingReason,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.reason == RoutingReason::NoIdentityFallback
    }
}

/// Route a principal: super admin, then organization, then legacy account, then master.
pub fn resolve_principal(principal: &Principal) -> Resolution {
    if principal.role == UserRole::SuperAdmin {
        return Resolution {
            identity: TenantIdentity::Master,
            reason: RoutingReason::SuperAdmin,
        };
    }
    if let Some(org) = principal.organization_id {
        return Resolution {
            identity: TenantIdentity::Organization(org),
            reason: RoutingReason::OrganizationMember,
        };
    }
    if let (Some(user_id), true) = (principal.id, principal.has_legacy_identity()) {
        return Resolution {
            identity: TenantIdentity::LegacyUser(user_id),
            reason: RoutingReason::LegacyAccount,
        };
    }
    tracing::warn!(
        user_id = ?principal.id,
        role = principal.role.as_str(),
        "principal has no organization or legacy identity, routing to master"
    );
    Resolution {
        identity: TenantIdentity::Master,
        reason: RoutingReason::NoIdentityFallback,
    }
}

/// Like [`resolve_principal`], but a principal without a usable identity is an error.
/// For organization-scoped endpoints.
pub fn require_tenant(principal: &Principal) -> Result<TenantIdentity, ResolutionError> {
    let resolution = resolve_principal(principal);
    if resolution.is_fallback() {
        return Err(ResolutionError::MissingIdentity);
    }
    Ok(resolution.identity)
}

/// Lowercase, drop the port and any trailing dot. Returns None for an empty host.
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    let normalized = without_port.trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostShape {
    /// A platform base domain itself.
    Apex,
    /// A reserved label under a base domain (`www`, `api`, ...).
    Reserved(String),
    /// A single candidate organization label under a base domain.
    Subdomain(String),
    /// Anything else; only a custom domain can match.
    Foreign(String),
}

/// Classify an already-normalized host against the configured base domains. The longest
/// matching base domain wins, so nested bases like `app.sonicus.eu` under `sonicus.eu` work.
pub fn classify_host(host: &str, settings: &HostSettings) -> HostShape {
    let mut bases: Vec<String> = settings
        .base_domains
        .iter()
        .map(|base| base.trim_end_matches('.').to_ascii_lowercase())
        .filter(|base| !base.is_empty())
        .collect();
    bases.sort_by(|a, b| b.len().cmp(&a.len()));

    for base in &bases {
        if host == base {
            return HostShape::Apex;
        }
        let label = match host.strip_suffix(base.as_str()).and_then(|p| p.strip_suffix('.')) {
            Some(label) => label,
            None => continue,
        };
        if label.is_empty() || label.contains('.') {
            continue;
        }
        if settings.is_reserved(label) {
            return HostShape::Reserved(label.to_string());
        }
        return HostShape::Subdomain(label.to_string());
    }
    HostShape::Foreign(host.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantMode {
    Organization,
    /// No tenant: marketing site and direct-to-consumer traffic.
    Platform,
}

impl TenantMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantMode::Organization => "organization",
            TenantMode::Platform => "platform",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    Header,
    CustomDomain,
    Subdomain,
    Default,
}

/// Outcome of host resolution, stored in request extensions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    pub mode: TenantMode,
    pub identity: TenantIdentity,
    pub organization: Option<OrganizationSummary>,
    pub resolved_via: ResolvedVia,
}

impl TenantContext {
    pub fn platform() -> Self {
        TenantContext {
            mode: TenantMode::Platform,
            identity: TenantIdentity::Master,
            organization: None,
            resolved_via: ResolvedVia::Default,
        }
    }

    pub fn for_organization(org: &Organization, via: ResolvedVia) -> Self {
        TenantContext {
            mode: TenantMode::Organization,
            identity: org.identity(),
            organization: Some(org.summary()),
            resolved_via: via,
        }
    }

    pub fn is_organization(&self) -> bool {
        self.mode == TenantMode::Organization
    }

    /// Organization id, or `platform`.
    pub fn identifier(&self) -> String {
        match &self.organization {
            Some(org) => org.id.to_string(),
            None => TenantMode::Platform.as_str().to_string(),
        }
    }

    pub fn summary(&self) -> Option<&OrganizationSummary> {
        self.organization.as_ref()
    }
}

/// Resolves requests to organizations: explicit header, then custom domain, then subdomain,
/// then platform mode.
#[derive(Clone)]
pub struct HostResolver {
    directory: Arc<dyn OrganizationDirectory>,
    settings: HostSettings,
}

fn routable(org: Organization) -> Result<Organization, ResolutionError> {
    if org.subscription_status.is_routable() {
        Ok(org)
    } else {
        Err(ResolutionError::OrganizationInactive(org.id))
    }
}

impl HostResolver {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, settings: HostSettings) -> Self {
        HostResolver { directory, settings }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub async fn resolve(&self, tenant_header: Option<&str>, host: Option<&str>) -> Result<TenantContext, TenancyError> {
        if let Some(raw) = tenant_header.map(str::trim).filter(|s| !s.is_empty()) {
            let id = Uuid::parse_str(raw).map_err(|_| ResolutionError::InvalidTenantHeader(raw.to_string()))?;
            let org = self
                .directory
                .find_by_id(id)
                .await?
                .ok_or_else(|| ResolutionError::OrganizationNotFound(raw.to_string()))?;
            return Ok(TenantContext::for_organization(&routable(org)?, ResolvedVia::Header));
        }

        let host = match host.and_then(normalize_host) {
            Some(host) => host,
            None => return Ok(TenantContext::platform()),
        };
        match classify_host(&host, &self.settings) {
            HostShape::Apex | HostShape::Reserved(_) => Ok(TenantContext::platform()),
            HostShape::Foreign(host) => match self.directory.find_by_custom_domain(&host).await? {
                Some(org) => Ok(TenantContext::for_organization(&routable(org)?, ResolvedVia::CustomDomain)),
                None => Ok(TenantContext::platform()),
            },
            HostShape::Subdomain(label) => {
                if let Some(org) = self.directory.find_by_custom_domain(&host).await? {
                    return Ok(TenantContext::for_organization(&routable(org)?, ResolvedVia::CustomDomain));
                }
                match self.directory.find_by_subdomain(&label).await? {
                    Some(org) => Ok(TenantContext::for_organization(&routable(org)?, ResolvedVia::Subdomain)),
                    None => {
                        tracing::debug!(host = %host, "no organization for subdomain");
                        Err(ResolutionError::OrganizationNotFound(label).into())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::MemoryDirectory;
    use crate::identity::SubscriptionStatus;

    #[test]
    fn super_admin_always_routes_to_master() {
        let p = Principal::new(1, UserRole::SuperAdmin).with_organization(Uuid::new_v4());
        let r = resolve_principal(&p);
        assert_eq!(r.identity, TenantIdentity::Master);
        assert_eq!(r.reason, RoutingReason::SuperAdmin);
    }

    #[test]
    fn organization_beats_legacy_identity() {
        let org = Uuid::new_v4();
        let p = Principal::new(7, UserRole::Staff)
            .with_organization(org)
            .with_firebase_uid("fb-7");
        assert_eq!(resolve_principal(&p).identity, TenantIdentity::Organization(org));
    }

    #[test]
    fn legacy_account_routes_to_user_database() {
        let p = Principal::new(7, UserRole::User).with_firebase_uid("fb-7");
        let r = resolve_principal(&p);
        assert_eq!(r.identity, TenantIdentity::LegacyUser(7));
        assert_eq!(r.reason, RoutingReason::LegacyAccount);
    }

    #[test]
    fn no_identity_falls_back_visibly() {
        let p = Principal::new(7, UserRole::User).with_firebase_uid("   ");
        let r = resolve_principal(&p);
        assert_eq!(r.identity, TenantIdentity::Master);
        assert!(r.is_fallback());
        assert_eq!(require_tenant(&p), Err(ResolutionError::MissingIdentity));
    }

    #[test]
    fn hosts_are_normalized() {
        assert_eq!(normalize_host("Acme.Sonicus.EU:8443").as_deref(), Some("acme.sonicus.eu"));
        assert_eq!(normalize_host("sounds.acme.com.").as_deref(), Some("sounds.acme.com"));
        assert_eq!(normalize_host("[::1]:3000").as_deref(), Some("::1"));
        assert_eq!(normalize_host("  "), None);
    }

    #[test]
    fn host_shapes() {
        let s = HostSettings::default();
        assert_eq!(classify_host("sonicus.eu", &s), HostShape::Apex);
        assert_eq!(classify_host("www.sonicus.eu", &s), HostShape::Reserved("www".into()));
        assert_eq!(classify_host("acme.sonicus.eu", &s), HostShape::Subdomain("acme".into()));
        assert_eq!(
            classify_host("a.b.sonicus.eu", &s),
            HostShape::Foreign("a.b.sonicus.eu".into())
        );
        assert_eq!(
            classify_host("notsonicus.eu", &s),
            HostShape::Foreign("notsonicus.eu".into())
        );
    }

    #[test]
    fn nested_base_domains_prefer_the_longest() {
        let s = HostSettings {
            base_domains: vec!["sonicus.eu".into(), "app.sonicus.eu".into()],
            ..HostSettings::default()
        };
        assert_eq!(classify_host("acme.app.sonicus.eu", &s), HostShape::Subdomain("acme".into()));
        assert_eq!(classify_host("app.sonicus.eu", &s), HostShape::Apex);
        assert_eq!(classify_host("acme.sonicus.eu", &s), HostShape::Subdomain("acme".into()));
        assert_eq!(classify_host("www.app.sonicus.eu", &s), HostShape::Reserved("www".into()));
        assert_eq!(
            classify_host("a.b.app.sonicus.eu", &s),
            HostShape::Foreign("a.b.app.sonicus.eu".into())
        );
    }

    fn org(domain: &str, custom: Option<&str>, status: SubscriptionStatus) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: domain.to_string(),
            domain: Some(domain.to_string()),
            custom_domain: custom.map(str::to_string),
            subscription_status: status,
            database_created: true,
            database_created_at: None,
        }
    }

    fn resolver(orgs: Vec<Organization>) -> HostResolver {
        let directory = Arc::new(MemoryDirectory::new());
        for o in orgs {
            directory.insert(o);
        }
        HostResolver::new(directory, HostSettings::default())
    }

    #[tokio::test]
    async fn header_takes_priority_over_host() {
        let acme = org("acme", None, SubscriptionStatus::Active);
        let other = org("other", None, SubscriptionStatus::Trial);
        let r = resolver(vec![acme.clone(), other.clone()]);
        let other_id = other.id.to_string();
        let ctx = r.resolve(Some(&other_id), Some("acme.sonicus.eu")).await.unwrap();
        assert_eq!(ctx.identity, other.identity());
        assert_eq!(ctx.resolved_via, ResolvedVia::Header);
    }

    #[tokio::test]
    async fn malformed_header_is_rejected() {
        let r = resolver(vec![]);
        let err = r.resolve(Some("not-a-uuid"), None).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::Resolution(ResolutionError::InvalidTenantHeader(_))
        ));
    }

    #[tokio::test]
    async fn custom_domain_resolves() {
        let acme = org("acme", Some("sounds.acme.com"), SubscriptionStatus::Active);
        let r = resolver(vec![acme.clone()]);
        let ctx = r.resolve(None, Some("Sounds.Acme.com:443")).await.unwrap();
        assert_eq!(ctx.identity, acme.identity());
        assert_eq!(ctx.resolved_via, ResolvedVia::CustomDomain);
        assert_eq!(ctx.identifier(), acme.id.to_string());
    }

    #[tokio::test]
    async fn custom_domain_beats_subdomain_for_one_host() {
        let acme = org("acme", None, SubscriptionStatus::Active);
        let owner = org("owner", Some("acme.sonicus.eu"), SubscriptionStatus::Active);
        let r = resolver(vec![acme, owner.clone()]);
        let ctx = r.resolve(None, Some("acme.sonicus.eu")).await.unwrap();
        assert_eq!(ctx.identity, owner.identity());
        assert_eq!(ctx.resolved_via, ResolvedVia::CustomDomain);
    }

    #[tokio::test]
    async fn subdomain_under_nested_base_domain_resolves() {
        let acme = org("acme", None, SubscriptionStatus::Trial);
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(acme.clone());
        let settings = HostSettings {
            base_domains: vec!["sonicus.eu".into(), "app.sonicus.eu".into()],
            ..HostSettings::default()
        };
        let r = HostResolver::new(directory, settings);
        let ctx = r.resolve(None, Some("acme.app.sonicus.eu")).await.unwrap();
        assert_eq!(ctx.identity, acme.identity());
        assert_eq!(ctx.resolved_via, ResolvedVia::Subdomain);

        let err = r.resolve(None, Some("ghost.app.sonicus.eu")).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::Resolution(ResolutionError::OrganizationNotFound(label)) if label == "ghost"
        ));
    }

    #[tokio::test]
    async fn suspended_organization_is_inactive() {
        let acme = org("acme", None, SubscriptionStatus::Suspended);
        let r = resolver(vec![acme.clone()]);
        let err = r.resolve(None, Some("acme.sonicus.eu")).await.unwrap_err();
        assert!(matches!(
            err,
            TenancyError::Resolution(ResolutionError::OrganizationInactive(id)) if id == acme.id
        ));
    }

    #[tokio::test]
    async fn unknown_foreign_host_is_platform() {
        let r = resolver(vec![]);
        let ctx = r.resolve(None, Some("localhost:8080")).await.unwrap();
        assert_eq!(ctx, TenantContext::platform());
        assert_eq!(ctx.identifier(), "platform");
        let ctx = r.resolve(None, None).await.unwrap();
        assert!(!ctx.is_organization());
    }
}
