use axum::{extract::State, response::IntoResponse, Json};
use testfleet_core::{PullRequest, ReportRequest, WorkerIdentity};

use crate::{error::ApiResult, response::ApiResponse, routes::AppState};

/// Worker 拉取下一个批次，没有可运行的批次时返回 204
pub async fn next_task_set(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> ApiResult<impl IntoResponse> {
    let worker = WorkerIdentity::new(request.worker_group, request.worker_id);
    let payload = state.job_manager.next_task_set(&worker)?;
    Ok(Json(payload))
}

/// Worker 回报批次结果
pub async fn report_result(
    State(state): State<AppState>,
    Json(report): Json<ReportRequest>,
) -> ApiResult<impl IntoResponse> {
    state.job_manager.handle_report(&report)?;
    Ok(ApiResponse::success_empty_with_message(format!(
        "批次 {}/{} 结果已记录",
        report.job_id, report.task_set_id
    )))
}
