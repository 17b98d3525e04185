//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks both stores

use crate::{
    services::{metadata_store, object_client},
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness only; never touches a store.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Pings the metadata store.
/// 2. Lists a single key under the managed prefix of the object store.
///
/// Each check is bounded by the store timeout. HTTP 200 when both checks
/// pass, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.reconciler.config();

    let ping = metadata_store::with_timeout(config.store_timeout, state.metadata.ping()).await;
    let metadata_check = match ping {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };

    let probe = object_client::with_timeout(
        config.store_timeout,
        state.objects.list_page(&config.prefix, None, 1),
    )
    .await;
    let object_check = match probe {
        Ok(_) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };

    let overall_ok = metadata_check.ok && object_check.ok;

    let mut checks = HashMap::new();
    checks.insert("metadata", metadata_check);
    checks.insert("object_store", object_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
