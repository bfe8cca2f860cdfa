//! Administrative tenant operations: invalidate, force provisioning, health, pool stats.

use crate::directory::OrganizationDirectory;
use crate::engine::Connector;
use crate::error::{ResolutionError, TenancyError};
use crate::identity::TenantIdentity;
use crate::response::{success_one_ok, success_with_meta, success_with_status};
use crate::state::TenancyState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ProvisionQuery {
    #[serde(default)]
    pub force: bool,
}

fn parse_organization_id(raw: &str) -> Result<Uuid, TenancyError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ResolutionError::InvalidTenantKey(raw.to_string()).into())
}

/// POST /admin/tenants/:key/invalidate drops the cached engine; the next access rebuilds it.
pub async fn invalidate_tenant<C: Connector>(
    State(state): State<TenancyState<C>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, TenancyError> {
    let identity: TenantIdentity = key.parse()?;
    let invalidated = state.registry().invalidate(&identity).await;
    Ok(success_one_ok(serde_json::json!({
        "tenant": identity.key(),
        "invalidated": invalidated,
    })))
}

/// POST /admin/organizations/:id/provision?force=bool. A forced run also drops the cached engine.
pub async fn provision_organization<C: Connector>(
    State(state): State<TenancyState<C>>,
    Path(id): Path<String>,
    Query(query): Query<ProvisionQuery>,
) -> Result<impl IntoResponse, TenancyError> {
    let id = parse_organization_id(&id)?;
    let org = state
        .broker
        .directory()
        .find_by_id(id)
        .await?
        .ok_or_else(|| ResolutionError::OrganizationNotFound(id.to_string()))?;
    let outcome = state.provisioner().try_provision(&org, query.force).await?;
    // A forced run may have changed the schema under a live pool.
    if query.force {
        state.registry().invalidate(&org.identity()).await;
    }
    Ok(success_one_ok(outcome))
}

/// GET /admin/organizations/:id/status
pub async fn provisioning_status<C: Connector>(
    State(state): State<TenancyState<C>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, TenancyError> {
    let id = parse_organization_id(&id)?;
    let status = state.provisioner().status(id).await?;
    Ok(success_one_ok(status))
}

/// GET /admin/tenants/:key/health: 503 when the tenant cannot serve traffic.
pub async fn tenant_health<C: Connector>(
    State(state): State<TenancyState<C>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, TenancyError> {
    let identity: TenantIdentity = key.parse()?;
    let report = state.maintenance.health_check(&identity).await?;
    let status = if report.status.is_available() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(success_with_status(status, report))
}

/// GET /admin/pools: pool statistics per cached tenant.
pub async fn pool_stats<C: Connector>(State(state): State<TenancyState<C>>) -> impl IntoResponse {
    let registry = state.registry();
    success_with_meta(
        registry.stats(),
        serde_json::json!({
            "engines_created": registry.engines_created(),
            "engines_disposed": registry.engines_disposed(),
        }),
    )
}
