// Signup HTTP routes
//
// Tier and free status in every response are computed from the live position
// with the configured threshold. The stored `cached_is_free` hint is not exposed.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use waitlist_positions::{
    FreeTierPolicy, MembershipTier, NewSignup, SignupFilter, SignupRecord, SignupRole,
};

use super::common::{ApiError, ErrorResponse, ListResponse};
use crate::services::PositionService;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

/// Request to register a signup
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateSignupRequest {
    /// Email address, unique across signups (case-insensitive).
    #[schema(example = "ada@example.com")]
    pub email: String,
    /// Display name.
    #[serde(default)]
    #[schema(example = "Ada")]
    pub name: Option<String>,
    /// Role; defaults to `member`. Administrators never take a position.
    #[serde(default)]
    pub role: Option<SignupRole>,
    /// Allocate a position right away (members only). Defaults to true.
    #[serde(default)]
    pub allocate: Option<bool>,
}

/// A signup with its live tier
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Signup {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: SignupRole,
    /// Position in the beta sequence; absent until allocated.
    pub position: Option<i64>,
    /// Tier computed from the current position.
    pub tier: MembershipTier,
    /// Whether the position is within the free threshold right now.
    pub is_free: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Signup {
    pub fn from_record(record: SignupRecord, tiers: FreeTierPolicy) -> Self {
        let tier = tiers.classify(&record);
        Self {
            id: record.id,
            email: record.email,
            name: record.name,
            role: record.role,
            position: record.position,
            tier,
            is_free: tier.is_free(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Result of allocating a position
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AllocateResponse {
    pub signup_id: Uuid,
    #[schema(example = 42)]
    pub position: i64,
    pub is_free: bool,
}

/// Live free-tier status of a signup
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IsFreeResponse {
    pub signup_id: Uuid,
    pub position: Option<i64>,
    pub is_free: bool,
    pub tier: MembershipTier,
    /// Threshold in effect for this answer.
    #[schema(example = 20)]
    pub threshold: i64,
}

/// Query parameters for listing signups
#[derive(Debug, Clone, Default, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListSignupsQuery {
    /// Only signups with this role.
    pub role: Option<SignupRole>,
    /// Page size (default 100, max 1000).
    pub limit: Option<u32>,
    /// Return signups created after the signup with this ID.
    pub after: Option<Uuid>,
}

/// App state for signup routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PositionService>,
}

impl AppState {
    pub fn new(service: Arc<PositionService>) -> Self {
        Self { service }
    }
}

/// Create signup routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/signups", post(create_signup).get(list_signups))
        .route("/v1/signups/:signup_id", get(get_signup).delete(delete_signup))
        .route("/v1/signups/:signup_id/allocate", post(allocate_position))
        .route("/v1/signups/:signup_id/is-free", get(get_is_free))
        .with_state(state)
}

/// POST /v1/signups - Register a signup
#[utoipa::path(
    post,
    path = "/v1/signups",
    request_body = CreateSignupRequest,
    responses(
        (status = 201, description = "Signup created (and allocated unless disabled)", body = Signup),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 503, description = "Allocation contended; nothing was stored and the request can be retried", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn create_signup(
    State(state): State<AppState>,
    Json(req): Json<CreateSignupRequest>,
) -> Result<(StatusCode, Json<Signup>), ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::bad_request("email must be a valid address"));
    }

    let role = req.role.unwrap_or_default();
    let signup = NewSignup {
        email: req.email,
        name: req.name.filter(|n| !n.trim().is_empty()),
        role,
    };
    let record = state
        .service
        .register(signup, req.allocate.unwrap_or(true))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(Signup::from_record(record, state.service.tiers())),
    ))
}

/// GET /v1/signups - List signups ordered by creation
#[utoipa::path(
    get,
    path = "/v1/signups",
    params(ListSignupsQuery),
    responses(
        (status = 200, description = "Signups in creation order", body = ListResponse<Signup>),
        (status = 400, description = "Unknown `after` cursor", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn list_signups(
    State(state): State<AppState>,
    Query(query): Query<ListSignupsQuery>,
) -> Result<Json<ListResponse<Signup>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let filter = SignupFilter { role: query.role };

    let records = state
        .service
        .list_signups(filter, query.after, limit)
        .await?
        .ok_or_else(|| ApiError::bad_request("`after` does not name an existing signup"))?;

    let tiers = state.service.tiers();
    Ok(Json(ListResponse::new(
        records
            .into_iter()
            .map(|r| Signup::from_record(r, tiers))
            .collect(),
    )))
}

/// GET /v1/signups/{signup_id} - Get a signup
#[utoipa::path(
    get,
    path = "/v1/signups/{signup_id}",
    params(
        ("signup_id" = Uuid, Path, description = "Signup ID")
    ),
    responses(
        (status = 200, description = "Signup found", body = Signup),
        (status = 404, description = "Signup not found", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn get_signup(
    State(state): State<AppState>,
    Path(signup_id): Path<Uuid>,
) -> Result<Json<Signup>, ApiError> {
    let record = state
        .service
        .get_signup(signup_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("signup not found: {}", signup_id)))?;
    Ok(Json(Signup::from_record(record, state.service.tiers())))
}

/// DELETE /v1/signups/{signup_id} - Remove a signup
///
/// Other signups keep their positions; run reconciliation to close the gap.
#[utoipa::path(
    delete,
    path = "/v1/signups/{signup_id}",
    params(
        ("signup_id" = Uuid, Path, description = "Signup ID")
    ),
    responses(
        (status = 204, description = "Signup deleted"),
        (status = 404, description = "Signup not found", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn delete_signup(
    State(state): State<AppState>,
    Path(signup_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.service.delete_signup(signup_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("signup not found: {}", signup_id)))
    }
}

/// POST /v1/signups/{signup_id}/allocate - Allocate the next position
#[utoipa::path(
    post,
    path = "/v1/signups/{signup_id}/allocate",
    params(
        ("signup_id" = Uuid, Path, description = "Signup ID")
    ),
    responses(
        (status = 200, description = "Position allocated", body = AllocateResponse),
        (status = 404, description = "Signup not found", body = ErrorResponse),
        (status = 409, description = "Signup already holds a position", body = ErrorResponse),
        (status = 422, description = "Signup is not a member", body = ErrorResponse),
        (status = 503, description = "Contention did not clear in time; try again", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn allocate_position(
    State(state): State<AppState>,
    Path(signup_id): Path<Uuid>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let position = state.service.allocate(signup_id).await?;
    Ok(Json(AllocateResponse {
        signup_id,
        position,
        is_free: state.service.tiers().is_free(Some(position)),
    }))
}

/// GET /v1/signups/{signup_id}/is-free - Live free-tier status
#[utoipa::path(
    get,
    path = "/v1/signups/{signup_id}/is-free",
    params(
        ("signup_id" = Uuid, Path, description = "Signup ID")
    ),
    responses(
        (status = 200, description = "Free-tier status", body = IsFreeResponse),
        (status = 404, description = "Signup not found", body = ErrorResponse),
    ),
    tag = "signups"
)]
pub async fn get_is_free(
    State(state): State<AppState>,
    Path(signup_id): Path<Uuid>,
) -> Result<Json<IsFreeResponse>, ApiError> {
    let record = state
        .service
        .get_signup(signup_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("signup not found: {}", signup_id)))?;

    let tiers = state.service.tiers();
    let tier = tiers.classify(&record);
    Ok(Json(IsFreeResponse {
        signup_id,
        position: record.position,
        is_free: tier.is_free(),
        tier,
        threshold: tiers.threshold,
    }))
}
