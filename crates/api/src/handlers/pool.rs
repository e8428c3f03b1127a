use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use testfleet_core::AddWorkerRequest;
use testfleet_dispatcher::WorkerPool;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

fn pool(state: &AppState) -> ApiResult<&Arc<WorkerPool>> {
    state
        .pool
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("服务未启用Worker池".to_string()))
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// 新增一个 Worker，主机和镜像为空时使用池的默认值
pub async fn add_worker(
    State(state): State<AppState>,
    Json(request): Json<AddWorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    let worker = pool(&state)?
        .add_worker(non_empty(&request.host), non_empty(&request.image))
        .await?;
    Ok(created(worker))
}

pub async fn list_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(pool(&state)?.workers().await))
}

/// 销毁池中全部 Worker，单个失败不影响其余
pub async fn remove_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(pool(&state)?.remove_workers().await))
}
