//! Common routes: health, readiness, version.

use crate::engine::{Connector, Engine};
use crate::identity::TenantIdentity;
use crate::state::TenancyState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'static str>,
    cached_engines: usize,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn ready<C: Connector>(State(state): State<TenancyState<C>>) -> (StatusCode, Json<ReadyBody>) {
    let master = match state.broker.engine_for(&TenantIdentity::Master).await {
        Ok(engine) => engine.ping().await,
        Err(e) => Err(e),
    };
    let cached_engines = state.registry().len();
    match master {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyBody {
                status: "ok",
                database: Some("ok"),
                cached_engines,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyBody {
                    status: "degraded",
                    database: Some("unavailable"),
                    cached_engines,
                }),
            )
        }
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Common routes (no state): GET /health, GET /version.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// Common routes plus GET /ready, which pings the master database.
pub fn common_routes_with_ready<C: Connector>(state: TenancyState<C>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready::<C>))
        .route("/version", get(version))
        .with_state(state)
}
