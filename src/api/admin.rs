//! Operational and platform-admin endpoints: `/health`, `/status`, and the
//! platform-admin roster under `/api/v1/platform/admins`.

use axum::{
    Json,
    extract::{Extension, Path, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::agent::orchestrator::AgentStatusReport;
use crate::auth::CallerIdentity;
use crate::auth::middleware::require_platform_admin;
use crate::error::GatewayError;
use crate::persistence::PlatformAdmin;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents: Vec<String>,
    pub primary: Option<String>,
}

/// Liveness. Never authenticated.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_owned(),
        agents: state.orchestrator.agent_names(),
        primary: state.orchestrator.primary_name(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub failover_enabled: bool,
    pub audit_queue_depth: usize,
    pub agents: Vec<AgentStatusReport>,
}

/// Detailed gateway state. Platform admins only.
pub async fn status(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> Result<Json<StatusResponse>, GatewayError> {
    require_platform_admin(&identity)?;
    Ok(Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        failover_enabled: state.config.resilience.failover_enabled,
        audit_queue_depth: state.audit.queue_depth(),
        agents: state.orchestrator.status().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    pub email: String,
    #[serde(default)]
    pub workos_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminList {
    pub admins: Vec<PlatformAdmin>,
}

fn db_or_unavailable(state: &AppState) -> Result<&dyn crate::persistence::PersistenceLayer, GatewayError> {
    state
        .persistence
        .as_deref()
        .ok_or_else(|| GatewayError::Unavailable("no database configured".to_owned()))
}

pub async fn list_admins(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> Result<Json<AdminList>, GatewayError> {
    require_platform_admin(&identity)?;
    let db = db_or_unavailable(&state)?;
    let admins = db
        .list_platform_admins()
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(Json(AdminList { admins }))
}

pub async fn add_admin(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(request): Json<AddAdminRequest>,
) -> Result<Response, GatewayError> {
    require_platform_admin(&identity)?;
    if request.email.trim().is_empty() || !request.email.contains('@') {
        return Err(GatewayError::invalid(
            "a valid email is required",
            Some("email"),
        ));
    }
    let db = db_or_unavailable(&state)?;
    let admin = db
        .add_platform_admin(
            request.email.trim(),
            request.workos_id.as_deref(),
            &identity.user_id,
        )
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    tracing::info!(email = %admin.email, added_by = %identity.user_id, "platform admin added");
    Ok((axum::http::StatusCode::CREATED, Json(admin)).into_response())
}

pub async fn remove_admin(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Path(email): Path<String>,
) -> Result<Response, GatewayError> {
    require_platform_admin(&identity)?;
    let db = db_or_unavailable(&state)?;
    let removed = db
        .remove_platform_admin(&email)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    if !removed {
        return Err(GatewayError::NotFound);
    }
    tracing::info!(email = %email, removed_by = %identity.user_id, "platform admin removed");
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}
