//! API request handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::{info, warn};

use rems_bootstrap::BootstrapRequest;
use rems_dispatch::CommandRequest;

use crate::ApiState;

/// Error envelope for requests that never reach a component.
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse {
            success: false,
            error: msg.to_string(),
        }),
    )
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// POST /api/v1/bootstrap
///
/// Always 200 once the procedure runs; failures are reported in the outcome's
/// `status` field.
pub async fn run_bootstrap(
    State(state): State<ApiState>,
    Json(request): Json<BootstrapRequest>,
) -> impl IntoResponse {
    let Some(procedure) = state.bootstrap else {
        return error_response("bootstrap is not configured", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    };

    let outcome = procedure.run(&request).await;
    if outcome.status.is_ok() {
        info!(status = ?outcome.status, "bootstrap request completed");
    } else {
        warn!(
            message = outcome.message.as_deref().unwrap_or_default(),
            "bootstrap request failed"
        );
    }
    Json(outcome).into_response()
}

/// POST /api/v1/commands
pub async fn dispatch_command(
    State(state): State<ApiState>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let Some(dispatcher) = state.dispatcher else {
        return error_response(
            "command dispatch is not configured",
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .into_response();
    };

    Json(dispatcher.dispatch(&request).await).into_response()
}
