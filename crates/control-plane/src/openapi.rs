// OpenAPI specification generation
//
// Shared by the API server (for Swagger UI) and the export-openapi binary
// (for static spec generation).

use crate::api;
use crate::api::ListResponse;
use utoipa::OpenApi;
use waitlist_positions::{
    MembershipTier, PositionChange, PositionCounter, ReconcilePlan, ReconcileReport, SignupRole,
};

/// OpenAPI documentation for the waitlist API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::signups::create_signup,
        api::signups::list_signups,
        api::signups::get_signup,
        api::signups::delete_signup,
        api::signups::allocate_position,
        api::signups::get_is_free,
        api::positions::get_counter,
        api::positions::reconcile,
    ),
    components(
        schemas(
            SignupRole, MembershipTier,
            api::signups::Signup,
            api::signups::CreateSignupRequest,
            api::signups::AllocateResponse,
            api::signups::IsFreeResponse,
            api::signups::ListSignupsQuery,
            ListResponse<api::signups::Signup>,
            PositionCounter, PositionChange, ReconcilePlan, ReconcileReport,
            api::positions::ReconcileQuery,
            api::ErrorResponse,
        )
    ),
    tags(
        (name = "signups", description = "Signup registration and position allocation"),
        (name = "positions", description = "Position counter and reconciliation"),
    ),
    info(
        title = "Waitlist API",
        version = "0.1.0",
        description = "API for beta signups, waitlist positions and free-tier status",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> String {
        Self::openapi()
            .to_pretty_json()
            .expect("Failed to serialize OpenAPI spec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lists_position_routes() {
        let json = ApiDoc::to_json();
        assert!(json.contains("/v1/signups/{signup_id}/allocate"));
        assert!(json.contains("/v1/positions/reconcile"));
        assert!(json.contains("ReconcileReport"));
    }
}
