//! rollgate-api — REST API for rollgate.
//!
//! Thin axum layer over [`RolloutController`]. Every response uses the
//! `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List rollout snapshots |
//! | POST | `/api/v1/rollouts` | Submit a rollout plan |
//! | GET | `/api/v1/rollouts/{id}` | Current rollout state |
//! | DELETE | `/api/v1/rollouts/{id}` | Garbage-collect a finished rollout |
//! | GET | `/api/v1/rollouts/{id}/plan` | Submitted plan |
//! | GET | `/api/v1/rollouts/{id}/history` | Audit log |
//! | POST | `/api/v1/rollouts/{id}/pause` | Pause at the next step boundary |
//! | POST | `/api/v1/rollouts/{id}/resume` | Resume a paused or halted rollout |
//! | POST | `/api/v1/rollouts/{id}/abort` | Abort and roll back |
//! | GET | `/api/v1/rollouts/{id}/gates` | Manual gates awaiting a decision |
//! | POST | `/api/v1/rollouts/{id}/gates/{gate}/approve` | Approve a manual gate |
//! | POST | `/api/v1/rollouts/{id}/gates/{gate}/reject` | Reject a manual gate |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use rollgate_engine::RolloutController;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: RolloutController,
}

/// Build the complete API router.
pub fn build_router(controller: RolloutController) -> Router {
    let api_state = ApiState { controller };

    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts).post(handlers::submit_rollout))
        .route("/rollouts/{id}", get(handlers::get_rollout).delete(handlers::delete_rollout))
        .route("/rollouts/{id}/plan", get(handlers::get_plan))
        .route("/rollouts/{id}/history", get(handlers::get_history))
        .route("/rollouts/{id}/pause", post(handlers::pause_rollout))
        .route("/rollouts/{id}/resume", post(handlers::resume_rollout))
        .route("/rollouts/{id}/abort", post(handlers::abort_rollout))
        .route("/rollouts/{id}/gates", get(handlers::awaiting_gates))
        .route("/rollouts/{id}/gates/{gate}/approve", post(handlers::approve_gate))
        .route("/rollouts/{id}/gates/{gate}/reject", post(handlers::reject_gate))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
