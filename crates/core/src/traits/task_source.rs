use async_trait::async_trait;

use crate::models::{ReportRequest, TaskSetPayload, WorkerIdentity};
use crate::FleetResult;

/// Worker 获取任务批次并回报结果的来源
///
/// 调度服务进程内直接由作业管理器实现，独立 Worker 进程通过 HTTP 客户端实现。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// 没有可运行的批次时返回 `Ok(None)`
    async fn next_task_set(&self, worker: &WorkerIdentity) -> FleetResult<Option<TaskSetPayload>>;

    async fn report(&self, report: ReportRequest) -> FleetResult<()>;
}
