mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use sonicus_tenancy::fake::FakeConnector;
use sonicus_tenancy::middleware::{TENANT_IDENTIFIER_HEADER, TENANT_ID_HEADER, TENANT_MODE_HEADER};
use sonicus_tenancy::{
    admin_routes, resolve_tenant, CurrentTenant, OrganizationSummary, OrganizationTenant, SubscriptionStatus, TenancyState,
    TenantContext,
};
use tower::ServiceExt;

async fn echo(CurrentTenant(context): CurrentTenant) -> Json<TenantContext> {
    Json(context)
}

async fn organization_only(OrganizationTenant(org): OrganizationTenant) -> Json<OrganizationSummary> {
    Json(org)
}

fn app(state: TenancyState<FakeConnector>) -> Router {
    Router::new()
        .route("/tenant", get(echo))
        .route("/organization", get(organization_only))
        .route_layer(from_fn_with_state(state.clone(), resolve_tenant::<FakeConnector>))
        .merge(admin_routes(state))
}

fn get_with_host(uri: &str, host: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn subdomain_resolves_to_active_organization() {
    let t = common::setup();
    let acme = t.register("acme", SubscriptionStatus::Active);
    let response = app(t.state.clone())
        .oneshot(get_with_host("/tenant", "acme.sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[TENANT_MODE_HEADER], "organization");
    assert_eq!(response.headers()[TENANT_IDENTIFIER_HEADER], acme.id.to_string().as_str());
    let body = json_body(response).await;
    assert_eq!(body["organization"]["id"], acme.id.to_string());
    assert_eq!(body["resolved_via"], "subdomain");
}

#[tokio::test]
async fn unknown_subdomain_is_not_found() {
    let t = common::setup();
    t.register("acme", SubscriptionStatus::Active);
    let response = app(t.state.clone())
        .oneshot(get_with_host("/tenant", "doesnotexist.sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "organization_not_found");
}

#[tokio::test]
async fn reserved_subdomain_is_platform_mode() {
    let t = common::setup();
    let response = app(t.state.clone())
        .oneshot(get_with_host("/tenant", "www.sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[TENANT_MODE_HEADER], "platform");
    assert_eq!(response.headers()[TENANT_IDENTIFIER_HEADER], "platform");
    let body = json_body(response).await;
    assert!(body["organization"].is_null());
}

#[tokio::test]
async fn suspended_organization_is_forbidden() {
    let t = common::setup();
    t.register("frozen", SubscriptionStatus::Suspended);
    let response = app(t.state.clone())
        .oneshot(get_with_host("/tenant", "frozen.sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tenant_header_overrides_host() {
    let t = common::setup();
    t.register("acme", SubscriptionStatus::Active);
    let other = t.register("other", SubscriptionStatus::Trial);
    let request = Request::builder()
        .uri("/tenant")
        .header("host", "acme.sonicus.eu")
        .header(TENANT_ID_HEADER, other.id.to_string())
        .body(Body::empty())
        .unwrap();
    let response = app(t.state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.headers()[TENANT_IDENTIFIER_HEADER], other.id.to_string().as_str());

    let bad = Request::builder()
        .uri("/tenant")
        .header(TENANT_ID_HEADER, "acme")
        .body(Body::empty())
        .unwrap();
    let response = app(t.state.clone()).oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_provision_invalidate_and_pools() {
    let t = common::setup();
    let org = t.register("acme", SubscriptionStatus::Active);
    let router = app(t.state.clone());

    let provision = Request::builder()
        .method("POST")
        .uri(format!("/admin/organizations/{}/provision", org.id))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(provision).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["outcome"], "provisioned");
    assert!(t.directory.get(org.id).unwrap().database_created);

    let health = Request::builder()
        .uri(format!("/admin/tenants/org:{}/health", org.id))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["status"], "healthy");

    let pools = Request::builder().uri("/admin/pools").body(Body::empty()).unwrap();
    let body = json_body(router.clone().oneshot(pools).await.unwrap()).await;
    assert!(body["data"][format!("org:{}", org.id)].is_object());

    let invalidate = Request::builder()
        .method("POST")
        .uri(format!("/admin/tenants/org:{}/invalidate", org.id))
        .body(Body::empty())
        .unwrap();
    let body = json_body(router.clone().oneshot(invalidate).await.unwrap()).await;
    assert_eq!(body["data"]["invalidated"], true);
    assert!(t.state.registry().is_empty());

    let bad_key = Request::builder()
        .method("POST")
        .uri("/admin/tenants/nonsense/invalidate")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(bad_key).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn organization_extractor_requires_an_organization() {
    let t = common::setup();
    let acme = t.register("acme", SubscriptionStatus::Active);
    let router = app(t.state.clone());

    let response = router
        .clone()
        .oneshot(get_with_host("/organization", "acme.sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["id"], acme.id.to_string());

    let response = router
        .oneshot(get_with_host("/organization", "sonicus.eu"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "tenant_required");
}

#[tokio::test]
async fn forced_provision_drops_cached_engine() {
    let t = common::setup();
    let org = t.register("acme", SubscriptionStatus::Active);
    let router = app(t.state.clone());

    let health = || {
        Request::builder()
            .uri(format!("/admin/tenants/org:{}/health", org.id))
            .body(Body::empty())
            .unwrap()
    };
    let response = router.clone().oneshot(health()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["data"]["status"], "not_provisioned");
    assert_eq!(t.backend.total_calls(), 0);

    t.state.broker.acquire(&org.identity()).await.unwrap().commit().await.unwrap();
    let cached = t.state.registry().get(&org.identity()).unwrap();

    let force = Request::builder()
        .method("POST")
        .uri(format!("/admin/organizations/{}/provision?force=true", org.id))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(force).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cached.is_disposed());
    assert!(!t.state.registry().contains(&org.identity()));

    let response = router.oneshot(health()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
