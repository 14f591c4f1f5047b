//! HTTP request handlers.
//!
//! Both sale endpoints take query parameters only and answer with plain
//! text bodies: `reserve` returns the reservation code, `purchase` returns
//! an empty body. Engine error variants map onto 400/409/500/503; the
//! health endpoints follow the probe conventions orchestrators expect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use flashsale_core::SaleError;

use crate::engine::generation::GenerationManager;

use super::shutdown::{HealthState, ShutdownController};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Owner of the live engine generation.
    pub manager: Arc<GenerationManager>,
    /// Process lifecycle controller.
    pub shutdown: Arc<ShutdownController>,
    /// Server start instant, for uptime reporting.
    pub start_time: Instant,
}

/// Query parameters for `POST /reserve`.
#[derive(Debug, Deserialize)]
pub struct ReserveParams {
    user_id: i64,
    item_id: i64,
}

/// Query parameters for `POST /purchase`.
#[derive(Debug, Deserialize)]
pub struct PurchaseParams {
    code: String,
}

/// Maps an engine error onto its HTTP rendition.
fn error_response(err: &SaleError) -> Response {
    match err {
        SaleError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        SaleError::Draining => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        SaleError::Internal(cause) => {
            error!(error = %cause, "request failed with internal error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
        conflict => {
            debug_assert!(conflict.is_conflict());
            (StatusCode::CONFLICT, conflict.to_string())
        }
    }
    .into_response()
}

fn draining_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        SaleError::Draining.to_string(),
    )
        .into_response()
}

/// `POST /reserve?user_id=&item_id=` -- 200 with the reservation code.
pub async fn reserve_handler(
    State(state): State<AppState>,
    params: Result<Query<ReserveParams>, QueryRejection>,
) -> Response {
    if state.shutdown.health_state() != HealthState::Ready {
        return draining_response();
    }
    let Query(params) = match params {
        Ok(query) => query,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, format!("invalid input: {rejection}"))
                .into_response()
        }
    };

    match state.manager.reserve(params.user_id, params.item_id).await {
        Ok(code) => (StatusCode::OK, code.to_string()).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /purchase?code=` -- 200 with an empty body.
pub async fn purchase_handler(
    State(state): State<AppState>,
    params: Result<Query<PurchaseParams>, QueryRejection>,
) -> Response {
    if state.shutdown.health_state() != HealthState::Ready {
        return draining_response();
    }
    let Query(params) = match params {
        Ok(query) => query,
        Err(rejection) => {
            return (StatusCode::BAD_REQUEST, format!("invalid input: {rejection}"))
                .into_response()
        }
    };
    let Ok(code) = Uuid::parse_str(&params.code) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid input: malformed reservation code {:?}", params.code),
        )
            .into_response();
    };

    match state.manager.purchase(code).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(&err),
    }
}

/// `GET /health` -- detailed health JSON.
///
/// Always returns 200; the `state` field distinguishes "up but draining"
/// from "down" for monitoring tools.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.manager.stats();
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "window_id": stats.window_id,
        "items": stats.items,
        "available": stats.counts.available,
        "reserved": stats.counts.reserved,
        "sold": stats.counts.sold,
        "sold_total": stats.sold_total,
        "active_reservations": stats.reservations,
        "in_flight": state.manager.in_flight(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe -- always 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe -- 200 when serving, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
