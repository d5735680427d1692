use crate::{
    auth::{check_machine_manager, check_machine_viewer, require_administrator, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use vm_orchestrator::{Account, BulkTarget, MachineRequest, MachineState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/machines", get(list_machines).post(create_machine))
        .route("/api/v1/machines/bulk", post(create_machines_bulk))
        .route("/api/v1/machines/{id}", get(get_machine).delete(delete_machine))
        .route("/api/v1/machines/{id}/start", post(start_machine))
        .route("/api/v1/machines/{id}/stop", post(stop_machine))
        .route("/api/v1/machines/{id}/owner", put(transfer_owner))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedMachines {
    pub ids: Vec<Uuid>,
}

/// A machine request plus exactly one of `count` or `group`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkCreateRequest {
    #[serde(flatten)]
    pub request: MachineRequest,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub group: Option<String>,
}

impl BulkCreateRequest {
    fn target(&self) -> ApiResult<BulkTarget> {
        match (self.count, &self.group) {
            (Some(count), None) => Ok(BulkTarget::Count(count)),
            (None, Some(group)) => Ok(BulkTarget::Group(group.clone())),
            _ => Err(ApiError::BadRequest(
                "exactly one of count or group is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferOwnerRequest {
    pub owner: Account,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferOwnerResponse {
    pub previous_owner: Account,
    pub owner: Account,
}

async fn list_machines(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<BTreeMap<Uuid, MachineState>>> {
    let states = state.orchestrator.visible_states(&user.account).await?;

    Ok(Json(states))
}

async fn create_machine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<MachineRequest>,
) -> ApiResult<(StatusCode, Json<CreatedMachines>)> {
    // The caller always owns what they create
    let id = state.orchestrator.create_machine(req, &user.account).await?;

    Ok((StatusCode::CREATED, Json(CreatedMachines { ids: vec![id] })))
}

async fn create_machines_bulk(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<BulkCreateRequest>,
) -> ApiResult<(StatusCode, Json<CreatedMachines>)> {
    require_administrator(&user)?;
    let target = req.target()?;

    let ids = state
        .orchestrator
        .create_machines_bulk(req.request, &user.account, target)
        .await?;

    Ok((StatusCode::CREATED, Json(CreatedMachines { ids })))
}

async fn get_machine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MachineState>> {
    check_machine_viewer(state.orchestrator.store(), id, &user).await?;

    let machine = state.orchestrator.machine_state(id).await?;

    Ok(Json(machine))
}

/// Responds with the deletion report; 500 when any step failed.
async fn delete_machine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    check_machine_manager(state.orchestrator.store(), id, &user).await?;

    let report = state.orchestrator.delete_machine_report(id).await;
    let status = if report.success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok((status, Json(report)).into_response())
}

async fn start_machine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MachineState>> {
    check_machine_viewer(state.orchestrator.store(), id, &user).await?;

    state.orchestrator.start_machine(id).await?;
    let machine = state.orchestrator.machine_state(id).await?;

    Ok(Json(machine))
}

async fn stop_machine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MachineState>> {
    check_machine_viewer(state.orchestrator.store(), id, &user).await?;

    state.orchestrator.stop_machine(id).await?;
    let machine = state.orchestrator.machine_state(id).await?;

    Ok(Json(machine))
}

async fn transfer_owner(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<TransferOwnerRequest>,
) -> ApiResult<Json<TransferOwnerResponse>> {
    check_machine_manager(state.orchestrator.store(), id, &user).await?;

    let previous_owner = state.orchestrator.transfer_ownership(id, &req.owner).await?;

    Ok(Json(TransferOwnerResponse {
        previous_owner,
        owner: req.owner,
    }))
}
