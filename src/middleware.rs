//! HTTP tenant resolution: the `resolve_tenant` layer and the extractors that read its result.

use crate::engine::Connector;
use crate::error::{ResolutionError, TenancyError};
use crate::identity::OrganizationSummary;
use crate::resolver::TenantContext;
use crate::state::TenancyState;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Explicit organization id; wins over the host.
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";
/// `organization` or `platform`. Informational only.
pub const TENANT_MODE_HEADER: &str = "X-Tenant-Mode";
/// Organization id, or `platform`. Informational only.
pub const TENANT_IDENTIFIER_HEADER: &str = "X-Tenant-Identifier";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ResolutionError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| ResolutionError::InvalidTenantHeader(format!("{} is not valid text", name))),
    }
}

/// Resolve the request's tenant, store the [`TenantContext`] in request extensions and tag
/// the response. Install with `axum::middleware::from_fn_with_state`.
pub async fn resolve_tenant<C: Connector>(
    State(state): State<TenancyState<C>>,
    mut request: Request,
    next: Next,
) -> Response {
    let tenant_header = match header_str(request.headers(), TENANT_ID_HEADER) {
        Ok(v) => v.map(str::to_string),
        Err(e) => return e.into_response(),
    };
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .map(str::to_string);
    let resolved = state
        .resolver
        .resolve(tenant_header.as_deref(), host.as_deref())
        .await;
    let context = match resolved {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };
    tracing::debug!(
        tenant = %context.identity,
        via = ?context.resolved_via,
        path = %request.uri().path(),
        "request tenant resolved"
    );

    let mode = HeaderValue::from_static(context.mode.as_str());
    let identifier = HeaderValue::from_str(&context.identifier()).ok();
    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(TENANT_MODE_HEADER, mode);
    if let Some(identifier) = identifier {
        headers.insert(TENANT_IDENTIFIER_HEADER, identifier);
    }
    response
}

/// Tenant context of the current request, if the layer ran.
pub fn current_tenant<B>(request: &axum::http::Request<B>) -> Option<&TenantContext> {
    request.extensions().get::<TenantContext>()
}

/// Extractor for the resolved [`TenantContext`]. Requires the `resolve_tenant` layer.
#[derive(Clone, Debug)]
pub struct CurrentTenant(pub TenantContext);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = TenancyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .map(CurrentTenant)
            .ok_or_else(|| ResolutionError::MissingIdentity.into())
    }
}

/// Like [`CurrentTenant`] but rejects platform-mode requests with 400.
#[derive(Clone, Debug)]
pub struct OrganizationTenant(pub OrganizationSummary);

#[async_trait]
impl<S> FromRequestParts<S> for OrganizationTenant
where
    S: Send + Sync,
{
    type Rejection = TenancyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .and_then(|c| c.organization.clone())
            .map(OrganizationTenant)
            .ok_or_else(|| ResolutionError::MissingIdentity.into())
    }
}
