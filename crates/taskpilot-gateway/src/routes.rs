//! API route handlers for the gateway.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, body::Bytes};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use taskpilot_automation::sync::SyncOutcome;
use taskpilot_automation::trigger::TriggerEvent;
use taskpilot_automation::{exits, reconcile, sync, trigger};
use taskpilot_core::TaskPilotError;

use super::server::AppState;
use super::webhook::{self, WebhookAction};

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn fail(status: StatusCode, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(serde_json::json!({"success": false, "error": error.to_string()})),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    fail(StatusCode::INTERNAL_SERVER_ERROR, e)
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskpilot-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "gateway": {
            "host": state.config.gateway.host,
            "port": state.config.gateway.port,
            "webhook_validation": !state.config.gateway.webhook_secret.is_empty(),
        },
        "sync": {
            "retry_window_hours": state.config.sync.retry_window_hours,
            "retry_grace_minutes": state.config.sync.retry_grace_minutes,
            "retry_batch_limit": state.config.sync.retry_batch_limit,
        }
    }))
}

// ── Automation CRUD ──────────────────────────────

pub async fn list_automations(State(state): State<Arc<AppState>>) -> ApiResult {
    let automations = state.db.list_automations().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "automations": automations,
    })))
}

#[derive(Deserialize)]
pub struct SaveAutomationBody {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub list_id: String,
    pub queue_id: String,
    pub definition: serde_json::Value,
}

fn default_true() -> bool {
    true
}

pub async fn save_automation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SaveAutomationBody>,
) -> ApiResult {
    // Reject rule bodies the trigger processor would choke on later.
    taskpilot_automation::AutomationDefinition::from_value(&body.definition)
        .map_err(|e| fail(StatusCode::BAD_REQUEST, e))?;

    let record = state
        .db
        .upsert_automation(
            &body.id,
            &body.name,
            body.enabled,
            &body.list_id,
            &body.queue_id,
            &body.definition,
        )
        .map_err(internal)?;
    tracing::info!("⚙️ Automation '{}' saved", record.id);
    Ok(Json(serde_json::json!({"success": true, "automation": record})))
}

pub async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.db.delete_automation(&id).map_err(internal)?;
    tracing::info!("⚙️ Automation '{id}' deleted");
    Ok(Json(serde_json::json!({"success": true})))
}

// ── Triggers and sweeps ──────────────────────────────

#[derive(Deserialize)]
pub struct TriggerBody {
    pub automation_id: String,
    pub trigger_type: String,
    #[serde(default)]
    pub membership_id: String,
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_id: String,
}

pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerBody>,
) -> ApiResult {
    let automation = state
        .db
        .get_automation(&body.automation_id)
        .map_err(|e| fail(StatusCode::NOT_FOUND, e))?;

    let event = match body.trigger_type.as_str() {
        "list_entry" => TriggerEvent::ListEntry {
            membership_id: body.membership_id,
            contact_id: body.contact_id,
        },
        "task_completed" if body.position == 0 => {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                "position must be >= 1 for task_completed triggers",
            ));
        }
        "task_completed" => TriggerEvent::TaskCompleted {
            task_id: body.task_id,
            position: body.position,
            completed_at: body.completed_at.unwrap_or_else(Utc::now),
            owner_id: body.owner_id,
            contact_id: body.contact_id,
        },
        other => {
            return Err(fail(
                StatusCode::BAD_REQUEST,
                format!("Unknown trigger type '{other}'"),
            ));
        }
    };

    match trigger::process_event(&state.db, &automation, event) {
        Ok(planned) => Ok(Json(serde_json::json!({
            "success": true,
            "run_id": planned.run_id,
            "planned_at": planned.planned_at,
            "planned_local": planned.planned_local,
            "task_name": planned.task_name,
            "position": planned.position,
        }))),
        // A past-due plan is a business outcome, not a server error: the
        // caller gets a 200 with the reason and no run is created.
        Err(TaskPilotError::PastDue { planned }) => Ok(Json(serde_json::json!({
            "success": false,
            "reason": "scheduled_time_in_past",
            "planned_at": planned,
        }))),
        Err(e @ TaskPilotError::Config(_)) => Err(fail(StatusCode::BAD_REQUEST, e)),
        Err(e) => Err(internal(e)),
    }
}

pub async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = reconcile::sweep(&state.db, state.crm.as_ref(), &state.config.sync)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({"success": true, "report": report})))
}

pub async fn sweep_exits(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = exits::sweep_exited(&state.db, state.crm.as_ref())
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({"success": true, "report": report})))
}

pub async fn full_sync(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = sync::full_resync(&state.db, state.crm.as_ref(), &state.config.sync)
        .await
        .map_err(internal)?;
    match report.outcome {
        SyncOutcome::TimedOut => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "error": "full resync exceeded its wall-clock budget",
                "report": report,
            })),
        )),
        _ => Ok(Json(serde_json::json!({"success": true, "report": report}))),
    }
}

// ── Webhook ingress ──────────────────────────────

pub async fn hubspot_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let signature = headers
        .get("X-HubSpot-Signature-v3")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !webhook::verify_signature(&state.config.gateway.webhook_secret, &body, signature) {
        tracing::warn!("📨 Webhook rejected: invalid signature");
        return Err(fail(StatusCode::UNAUTHORIZED, "invalid webhook signature"));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| fail(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")))?;
    let (actions, ignored) = webhook::extract_actions(&payload);

    let mut engagements = 0usize;
    for action in actions {
        match action {
            WebhookAction::CallCreated { call_id } => {
                match exits::on_call_engagement(&state.db, state.crm.as_ref(), &call_id).await {
                    Ok(report) => engagements += report.tasks_completed,
                    Err(e) => {
                        // Webhook responses must stay 2xx; the failure is
                        // visible in the logs and the run ledger.
                        tracing::warn!("📨 Engagement reaction for call {call_id} failed: {e}");
                    }
                }
            }
        }
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "tasks_completed": engagements,
        "ignored_events": ignored,
    })))
}

// ── Monitor views ──────────────────────────────

#[derive(Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn recent_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let runs = state.db.recent_runs(query.limit).map_err(internal)?;
    Ok(Json(serde_json::json!({"success": true, "runs": runs})))
}

pub async fn recent_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let executions = state.db.recent_executions(query.limit).map_err(internal)?;
    Ok(Json(serde_json::json!({"success": true, "executions": executions})))
}
