use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use testfleet_api::{create_app, AppState};
use testfleet_core::{AppConfig, ProvisionerKind, TaskSource, WorkerIdentity, WorkerProvisioner};
use testfleet_dispatcher::{JobManager, Profiler, Scheduler, WorkerPool};
use testfleet_infrastructure::{DockerProvisioner, LocalProcessProvisioner};
use testfleet_worker::{DispatcherClient, WorkerService, WorkerServiceBuilder};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 调度服务：HTTP 接口、作业管理与 Worker 池
    Server,
    /// 独立 Worker，通过 HTTP 连接调度服务
    Worker,
    /// 调度服务加一个进程内 Worker
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "server" => Ok(AppMode::Server),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }
}

/// 应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        Self { config, mode }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行直到收到关闭信号，各组件向 `shutdown` 登记并在退出时释放
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        match self.mode {
            AppMode::Server => self.run_server(&shutdown).await,
            AppMode::Worker => self.run_worker(&shutdown).await,
            AppMode::All => self.run_all(&shutdown).await,
        }
    }

    fn job_manager(&self) -> Arc<JobManager> {
        let scheduler = Arc::new(Scheduler::new(self.config.scheduler.max_depth));
        Arc::new(JobManager::new(
            &self.config.scheduler,
            scheduler,
            Arc::new(Profiler::new()),
        ))
    }

    fn provisioner(&self) -> Result<Arc<dyn WorkerProvisioner>> {
        let provisioner: Arc<dyn WorkerProvisioner> = match self.config.pool.provisioner {
            ProvisionerKind::Local => Arc::new(
                LocalProcessProvisioner::current_exe().context("无法定位当前可执行文件")?,
            ),
            ProvisionerKind::Docker => Arc::new(DockerProvisioner::default()),
        };
        Ok(provisioner)
    }

    fn pool(&self) -> Result<Arc<WorkerPool>> {
        Ok(Arc::new(WorkerPool::new(
            self.provisioner()?,
            self.config.pool.clone(),
        )))
    }

    fn worker_identity(&self) -> WorkerIdentity {
        WorkerIdentity::new(self.config.worker.group.clone(), self.config.worker.worker_id)
    }

    fn worker_service(&self, source: Arc<dyn TaskSource>) -> Result<WorkerService> {
        WorkerServiceBuilder::from_config(&self.config.worker, self.worker_identity(), source)
            .build()
            .context("创建Worker服务失败")
    }

    /// 运行调度服务
    async fn run_server(&self, shutdown: &ShutdownManager) -> Result<()> {
        let job_manager = self.job_manager();
        let pool = self.pool()?;
        self.serve(job_manager, pool, shutdown).await
    }

    async fn serve(
        &self,
        job_manager: Arc<JobManager>,
        pool: Arc<WorkerPool>,
        shutdown: &ShutdownManager,
    ) -> Result<()> {
        // Worker 池销毁完成后才算退出
        let (mut shutdown_rx, _drain) = shutdown.register("调度服务");
        let bind_address = &self.config.server.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("调度服务启动在 http://{}", bind_address);

        let started = pool.start_initial().await;
        if self.config.pool.initial_workers > 0 {
            info!(
                "通过 {:?} 启动了 {} 个 Worker",
                self.config.pool.provisioner, started
            );
        }

        let app = create_app(
            AppState {
                job_manager,
                pool: Some(Arc::clone(&pool)),
            },
            self.config.server.max_request_size_mb,
        );
        let served = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("调度服务收到关闭信号");
            })
            .await;

        let summary = pool.remove_workers().await;
        if !summary.failed.is_empty() {
            warn!("以下 Worker 未能销毁: {:?}", summary.failed);
        }

        served.context("调度服务运行失败")?;
        info!("调度服务已停止");
        Ok(())
    }

    /// 运行独立 Worker
    async fn run_worker(&self, shutdown: &ShutdownManager) -> Result<()> {
        let (shutdown_rx, _drain) =
            shutdown.register(format!("Worker {}", self.worker_identity().name()));
        info!(
            "Worker {} 连接调度服务 {}",
            self.worker_identity(),
            self.config.worker.server_url
        );
        let client = DispatcherClient::new(self.config.worker.server_url.as_str())
            .context("创建调度服务客户端失败")?;
        let service = self.worker_service(Arc::new(client))?;
        service.run(shutdown_rx).await.context("Worker运行失败")?;
        Ok(())
    }

    /// 调度服务和进程内 Worker 共享同一个作业管理器
    async fn run_all(&self, shutdown: &ShutdownManager) -> Result<()> {
        info!("启动调度服务和进程内 Worker");
        let job_manager = self.job_manager();
        let pool = self.pool()?;
        let worker = self.worker_service(Arc::clone(&job_manager) as Arc<dyn TaskSource>)?;

        let (worker_rx, drain) = shutdown.register("进程内 Worker");
        let worker_handle = tokio::spawn(async move {
            let _drain = drain;
            if let Err(e) = worker.run(worker_rx).await {
                error!("进程内 Worker 运行失败: {}", e);
            }
        });

        let served = self.serve(job_manager, pool, shutdown).await;
        if let Err(e) = worker_handle.await {
            error!("进程内 Worker 任务异常: {}", e);
        }
        served
    }
}
