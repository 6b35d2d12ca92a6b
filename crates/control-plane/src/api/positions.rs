// Position counter and reconciliation routes

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use waitlist_positions::{PositionCounter, ReconcilePlan, ReconcileReport};

use super::common::{ApiError, ErrorResponse};
use crate::services::PositionService;

/// Query parameters for reconciliation
#[derive(Debug, Clone, Default, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReconcileQuery {
    /// Compute the plan without writing anything.
    #[serde(default)]
    pub dry_run: bool,
}

/// App state for position routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PositionService>,
}

impl AppState {
    pub fn new(service: Arc<PositionService>) -> Self {
        Self { service }
    }
}

/// Create position routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/positions/counter", get(get_counter))
        .route("/v1/positions/reconcile", post(reconcile))
        .with_state(state)
}

/// GET /v1/positions/counter - Current position counter
#[utoipa::path(
    get,
    path = "/v1/positions/counter",
    responses(
        (status = 200, description = "Highest allocated position", body = PositionCounter),
    ),
    tag = "positions"
)]
pub async fn get_counter(State(state): State<AppState>) -> Result<Json<PositionCounter>, ApiError> {
    Ok(Json(state.service.counter().await?))
}

/// POST /v1/positions/reconcile - Re-derive the gap-free position sequence
///
/// Free/paid status can change for records whose position shifts; the report
/// counts those in `tier_changes`. With `dry_run=true` the plan is returned
/// and nothing is written.
#[utoipa::path(
    post,
    path = "/v1/positions/reconcile",
    params(ReconcileQuery),
    responses(
        (status = 200, description = "Reconciliation report, or the plan for a dry run", body = ReconcileReport),
        (status = 503, description = "A batch or the counter update failed; safe to rerun", body = ErrorResponse),
        (status = 504, description = "Deadline exceeded; safe to rerun", body = ErrorResponse),
    ),
    tag = "positions"
)]
pub async fn reconcile(
    State(state): State<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> Result<Response, ApiError> {
    if query.dry_run {
        let plan: ReconcilePlan = state.service.plan_reconcile().await?;
        return Ok(Json(plan).into_response());
    }

    let report = state.service.reconcile().await?;
    Ok(Json(report).into_response())
}
