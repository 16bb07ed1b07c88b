//! REST API handlers for rollout management.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use rollgate_core::RolloutPlan;
use rollgate_engine::EngineError;

use crate::ApiState;

/// Response envelope shared by every endpoint.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn api_error(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) | EngineError::IllegalTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(err: EngineError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    api_error(&err.to_string(), status)
}

fn respond<T: serde::Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Request body for rejecting a manual gate.
#[derive(Debug, Default, serde::Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.controller.list())
}

/// POST /api/v1/rollouts
pub async fn submit_rollout(
    State(state): State<ApiState>,
    Json(plan): Json<RolloutPlan>,
) -> impl IntoResponse {
    let plan_id = plan.id.clone();
    match state.controller.submit(plan).await {
        Ok(rollout) => {
            info!(plan = %plan_id, stage = %rollout.stage, "rollout submitted via API");
            (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response()
        }
        Err(e) => engine_error(e),
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.controller.status(&id))
}

/// DELETE /api/v1/rollouts/{id}
///
/// Drops the plan body of a finished rollout; status and history remain.
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.gc(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => api_error("rollout plan already collected", StatusCode::NOT_FOUND),
        Err(e) => engine_error(e),
    }
}

/// GET /api/v1/rollouts/{id}/plan
pub async fn get_plan(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.controller.plan(&id))
}

/// GET /api/v1/rollouts/{id}/history
pub async fn get_history(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.controller.history(&id))
}

/// POST /api/v1/rollouts/{id}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.controller.pause(&id).await)
}

/// POST /api/v1/rollouts/{id}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.controller.resume(&id).await)
}

/// POST /api/v1/rollouts/{id}/abort
pub async fn abort_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.controller.abort(&id).await)
}

/// GET /api/v1/rollouts/{id}/gates
pub async fn awaiting_gates(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.controller.awaiting_gates(&id))
}

/// POST /api/v1/rollouts/{id}/gates/{gate}/approve
///
/// Answers 409 when the gate is not waiting on a decision.
pub async fn approve_gate(
    State(state): State<ApiState>,
    Path((id, gate)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.controller.approve(&id, &gate).map(|()| "approved"))
}

/// POST /api/v1/rollouts/{id}/gates/{gate}/reject
pub async fn reject_gate(
    State(state): State<ApiState>,
    Path((id, gate)): Path<(String, String)>,
    Json(req): Json<RejectRequest>,
) -> impl IntoResponse {
    respond(state.controller.reject(&id, &gate, &req.reason).map(|()| "rejected"))
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rollgate_cluster::InMemoryCluster;
    use rollgate_core::{PodTemplate, WorkloadGroupSpec};
    use rollgate_engine::RolloutController;
    use rollgate_state::{Stage, StateStore};

    fn test_state() -> (ApiState, InMemoryCluster) {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = InMemoryCluster::new();
        cluster.insert_group(WorkloadGroupSpec {
            name: "api-v1".to_string(),
            replicas: 2,
            template: PodTemplate {
                image: "registry/api:v1".to_string(),
                labels: [
                    ("app".to_string(), "api".to_string()),
                    ("version".to_string(), "v1".to_string()),
                ]
                .into(),
                container_port: 8080,
                readiness: None,
            },
            resource_version: None,
        });
        let controller = RolloutController::new(store, Arc::new(cluster.clone()));
        (ApiState { controller }, cluster)
    }

    fn test_plan(gates: serde_json::Value) -> RolloutPlan {
        serde_json::from_value(serde_json::json!({
            "id": "api-v2",
            "source": "api-v1",
            "target": {
                "name": "api-v2",
                "template": {
                    "image": "registry/api:v2",
                    "labels": {"app": "api", "version": "v2"},
                    "container_port": 8080
                }
            },
            "endpoint": {
                "name": "api",
                "selector": {"app": "api"},
                "target_port": 8080
            },
            "schedule": [
                {"source_replicas": 2, "target_replicas": 0},
                {"source_replicas": 1, "target_replicas": 1},
                {"source_replicas": 0, "target_replicas": 2}
            ],
            "gates": gates,
            "policy": {
                "step_timeout_ms": 2000,
                "poll_interval_ms": 1,
                "gate_poll_interval_ms": 1,
                "gate_deadline_ms": 2000,
                "retry": {"max_attempts": 3, "base_delay_ms": 1, "max_delay_ms": 5}
            }
        }))
        .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_created_and_runs_to_completion() {
        let (state, cluster) = test_state();

        let resp = submit_rollout(State(state.clone()), Json(test_plan(serde_json::json!([]))))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["plan_id"], "api-v2");

        let done = state.controller.wait("api-v2").await.unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert!(cluster.group("api-v1").is_none());

        let resp = get_rollout(State(state.clone()), Path("api-v2".to_string()))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["stage"], "completed");

        let resp = get_history(State(state), Path("api-v2".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["data"].as_array().unwrap().len() > 5);
    }

    #[tokio::test]
    async fn invalid_plan_is_bad_request() {
        let (state, _) = test_state();
        let mut plan = test_plan(serde_json::json!([]));
        plan.schedule.pop();

        let resp = submit_rollout(State(state), Json(plan)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn overflowing_schedule_is_bad_request() {
        let (state, cluster) = test_state();
        let mut plan = test_plan(serde_json::json!([]));
        plan.schedule[0].source_replicas = u32::MAX;
        plan.schedule[0].target_replicas = 1;

        let resp = submit_rollout(State(state), Json(plan)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("overflow"));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicate_submission_while_running_conflicts() {
        let (state, _) = test_state();
        let gates = serde_json::json!([{"name": "qa", "stage": "each_step", "kind": "manual_approval"}]);

        let resp = submit_rollout(State(state.clone()), Json(test_plan(gates.clone())))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = submit_rollout(State(state.clone()), Json(test_plan(gates)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = abort_rollout(State(state.clone()), Path("api-v2".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let done = state.controller.wait("api-v2").await.unwrap();
        assert_eq!(done.stage, Stage::RolledBack);
    }

    #[tokio::test]
    async fn unknown_rollout_is_not_found() {
        let (state, _) = test_state();

        let resp = get_rollout(State(state.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = pause_rollout(State(state.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = delete_rollout(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_gate_rejection_rolls_back() {
        let (state, cluster) = test_state();
        let gates = serde_json::json!([{"name": "qa", "stage": "verify", "kind": "manual_approval"}]);
        submit_rollout(State(state.clone()), Json(test_plan(gates)))
            .await
            .into_response();

        let resp = reject_gate(
            State(state.clone()),
            Path(("api-v2".to_string(), "smoke".to_string())),
            Json(RejectRequest::default()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let reject = || {
            reject_gate(
                State(state.clone()),
                Path(("api-v2".to_string(), "qa".to_string())),
                Json(RejectRequest {
                    reason: "checkout broken".to_string(),
                }),
            )
        };
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let resp = awaiting_gates(State(state.clone()), Path("api-v2".to_string()))
                .await
                .into_response();
            let body = body_json(resp).await;
            if body["data"][0]["gate"] == "qa" {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "qa never awaited a decision");
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(reject().await.into_response().status(), StatusCode::OK);

        let done = state.controller.wait("api-v2").await.unwrap();
        assert_eq!(done.stage, Stage::RolledBack);
        assert!(done.last_error.unwrap().contains("checkout broken"));
        assert_eq!(cluster.group("api-v1").unwrap().replicas, 2);

        // The evaluation is gone; a second decision has nothing to answer.
        assert_eq!(reject().await.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn completed_rollout_rejects_abort_and_can_be_deleted() {
        let (state, _) = test_state();
        submit_rollout(State(state.clone()), Json(test_plan(serde_json::json!([]))))
            .await
            .into_response();
        state.controller.wait("api-v2").await.unwrap();

        let resp = abort_rollout(State(state.clone()), Path("api-v2".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = delete_rollout(State(state.clone()), Path("api-v2".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = get_plan(State(state.clone()), Path("api-v2".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = list_rollouts(State(state)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"][0]["stage"], "completed");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = healthz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"], "ok");
    }
}
