//! rems-api — HTTP surface for the REMS ops tooling.
//!
//! Exposes the bootstrap procedure and the command dispatcher as JSON
//! endpoints. Either component may be absent; its routes then answer 503.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/bootstrap` | Ensure the service role and database exist |
//! | POST | `/api/v1/commands` | Run one admin command to a terminal state |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use rems_bootstrap::BootstrapProcedure;
use rems_dispatch::CommandDispatcher;

/// Shared state for API handlers.
#[derive(Clone, Default)]
pub struct ApiState {
    pub bootstrap: Option<Arc<BootstrapProcedure>>,
    pub dispatcher: Option<Arc<CommandDispatcher>>,
}

impl ApiState {
    pub fn new(
        bootstrap: Option<Arc<BootstrapProcedure>>,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> Self {
        Self {
            bootstrap,
            dispatcher,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/bootstrap", post(handlers::run_bootstrap))
        .route("/commands", post(handlers::dispatch_command))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
}
