use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::WorkerIdentity;
use crate::FleetResult;

/// 创建一个 Worker 所需的全部信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLaunch {
    pub identity: WorkerIdentity,
    pub name: String,
    pub host: String,
    pub image: String,
    /// Worker 回连调度服务的地址
    pub server_address: String,
}

/// 已创建 Worker 的句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub name: String,
    pub host: String,
    /// 容器ID或进程ID
    pub backend_id: String,
}

/// Worker 生命周期接口
///
/// 每个句柄的 `stop` 结果相互独立，一个失败不影响其他句柄。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    /// 创建并启动 Worker
    async fn start(&self, launch: &WorkerLaunch) -> FleetResult<WorkerHandle>;

    /// 停止并销毁 Worker
    async fn stop(&self, handle: &WorkerHandle) -> FleetResult<()>;

    fn name(&self) -> &'static str;
}
