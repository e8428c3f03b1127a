use axum::{extract::State, response::IntoResponse, Json};
use testfleet_core::TestRequest;
use tracing::info;

use crate::{error::ApiResult, response::plain_text, routes::AppState};

/// 提交一次测试运行，作业结束后返回 `go test` 风格的结果文本
pub async fn run_tests(
    State(state): State<AppState>,
    Json(request): Json<TestRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.job_manager.submit(request).await?;
    let job_id = handle.id();
    let report = handle.wait().await?;
    info!(
        "作业 {} 结束: {} ({} 个测试, {} 个失败)",
        job_id,
        report.status.as_str(),
        report.total_tasks,
        report.failed_tasks.len()
    );
    Ok(plain_text(report.status_line()))
}
