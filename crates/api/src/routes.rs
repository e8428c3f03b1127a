use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use testfleet_dispatcher::{JobManager, WorkerPool};

use crate::handlers::{
    health::health_check,
    jobs::{get_job, list_jobs},
    pool::{add_worker, list_workers, remove_workers},
    test_runs::run_tests,
    workers::{next_task_set, report_result},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub job_manager: Arc<JobManager>,
    /// 为空时池管理接口返回 404
    pub pool: Option<Arc<WorkerPool>>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 测试运行
        .route("/api/test", post(run_tests))
        // Worker 拉取与回报
        .route("/api/workers/next", post(next_task_set))
        .route("/api/workers/report", post(report_result))
        // Worker 池管理
        .route(
            "/api/pool/workers",
            get(list_workers).post(add_worker).delete(remove_workers),
        )
        // 作业查询
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .with_state(state)
}
