use axum::{
    extract::{Path, State},
    response::IntoResponse,
};

use crate::{error::ApiResult, response::success, routes::AppState};

/// 当前作业概要
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.job_manager.active_jobs()))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let job = state.job_manager.job(id)?;
    Ok(success(job.summary()))
}
