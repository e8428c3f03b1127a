use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use testfleet_core::{
    FleetResult, PoolConfig, WorkerHandle, WorkerIdentity, WorkerInfo, WorkerLaunch,
    WorkerProvisioner,
};

/// 批量销毁的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownSummary {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

struct PooledWorker {
    info: WorkerInfo,
    handle: WorkerHandle,
}

/// Worker 池管理器
pub struct WorkerPool {
    provisioner: Arc<dyn WorkerProvisioner>,
    config: PoolConfig,
    /// 下一个可用序号，只在创建成功后递增
    next_ordinal: Mutex<u32>,
    workers: Mutex<Vec<PooledWorker>>,
}

impl WorkerPool {
    pub fn new(provisioner: Arc<dyn WorkerProvisioner>, config: PoolConfig) -> Self {
        Self {
            provisioner,
            config,
            next_ordinal: Mutex::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// 创建一个 Worker；失败只影响本次调用，序号留给下一次创建
    pub async fn add_worker(&self, host: Option<&str>, image: Option<&str>) -> FleetResult<WorkerInfo> {
        let mut next_ordinal = self.next_ordinal.lock().await;
        let ordinal = *next_ordinal;
        let identity = WorkerIdentity::new(self.config.group.clone(), ordinal);
        let launch = WorkerLaunch {
            name: identity.name(),
            identity: identity.clone(),
            host: host.unwrap_or(&self.config.host).to_string(),
            image: image.unwrap_or(&self.config.image).to_string(),
            server_address: self.config.advertise_address.clone(),
        };

        let handle = match self.provisioner.start(&launch).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "通过 {} 创建 Worker {} 失败: {}",
                    self.provisioner.name(),
                    launch.name,
                    e
                );
                return Err(e);
            }
        };
        *next_ordinal += 1;
        drop(next_ordinal);

        let info = WorkerInfo {
            identity,
            name: launch.name,
            host: launch.host,
            image: launch.image,
            created_at: Utc::now(),
        };
        info!(
            "Worker {} 已在 {} 上启动 ({})",
            info.name, info.host, handle.backend_id
        );
        self.workers.lock().await.push(PooledWorker {
            info: info.clone(),
            handle,
        });
        Ok(info)
    }

    /// 按配置创建初始 Worker，单个失败不影响其余
    pub async fn start_initial(&self) -> usize {
        let mut started = 0;
        for _ in 0..self.config.initial_workers {
            if self.add_worker(None, None).await.is_ok() {
                started += 1;
            }
        }
        if started < self.config.initial_workers {
            warn!(
                "初始 Worker 只启动了 {}/{}",
                started, self.config.initial_workers
            );
        }
        started
    }

    /// 停止所有 Worker，失败记录后继续
    pub async fn remove_workers(&self) -> TeardownSummary {
        let workers: Vec<PooledWorker> = self.workers.lock().await.drain(..).collect();
        if workers.is_empty() {
            return TeardownSummary::default();
        }
        info!("开始销毁 {} 个 Worker", workers.len());

        let results = join_all(workers.iter().map(|worker| self.provisioner.stop(&worker.handle))).await;

        let mut summary = TeardownSummary::default();
        for (worker, result) in workers.iter().zip(results) {
            match result {
                Ok(()) => summary.stopped.push(worker.info.name.clone()),
                Err(e) => {
                    warn!("销毁 Worker {} 失败: {}", worker.info.name, e);
                    summary.failed.push(worker.info.name.clone());
                }
            }
        }
        info!(
            "Worker 销毁完成: 成功 {}, 失败 {}",
            summary.stopped.len(),
            summary.failed.len()
        );
        summary
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|worker| worker.info.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }
}
