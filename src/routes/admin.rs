//! Administrative routes. Mount behind the embedding service's admin authentication.

use crate::engine::Connector;
use crate::handlers::admin::{
    invalidate_tenant, pool_stats, provision_organization, provisioning_status, tenant_health,
};
use crate::state::TenancyState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn admin_routes<C: Connector>(state: TenancyState<C>) -> Router {
    Router::new()
        .route("/admin/tenants/:key/invalidate", post(invalidate_tenant::<C>))
        .route("/admin/tenants/:key/health", get(tenant_health::<C>))
        .route("/admin/organizations/:id/provision", post(provision_organization::<C>))
        .route("/admin/organizations/:id/status", get(provisioning_status::<C>))
        .route("/admin/pools", get(pool_stats::<C>))
        .with_state(state)
}
