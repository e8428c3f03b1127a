use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, info_span, warn, Instrument};

use testfleet_core::{
    FleetError, FleetResult, ReportRequest, TaskSetPayload, TaskSource, WorkerConfig, WorkerIdentity,
};
use testfleet_infrastructure::{BuildOutcome, PackageBuilder, RepositoryRegistry, SourceWatcher};

use crate::executor::{shutdown_signal, TestExecutor};

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    identity: WorkerIdentity,
    source: Arc<dyn TaskSource>,
    work_dir: PathBuf,
    go_binary: String,
    poll_interval: Duration,
    exec_timeout: Duration,
    build_timeout: Duration,
    prebuild_debounce: Option<Duration>,
}

impl WorkerServiceBuilder {
    /// 创建新的构建器
    pub fn new(identity: WorkerIdentity, source: Arc<dyn TaskSource>) -> Self {
        Self {
            identity,
            source,
            work_dir: std::env::temp_dir().join("testfleet"),
            go_binary: "go".to_string(),
            poll_interval: Duration::from_millis(500),
            exec_timeout: Duration::from_secs(600),
            build_timeout: Duration::from_secs(600),
            prebuild_debounce: None,
        }
    }

    /// 按配置文件中的 `worker` 段创建
    pub fn from_config(config: &WorkerConfig, identity: WorkerIdentity, source: Arc<dyn TaskSource>) -> Self {
        let prebuild_debounce = config
            .prebuild_on_change
            .then(|| Duration::from_millis(config.prebuild_debounce_ms));
        Self::new(identity, source)
            .work_dir(&config.work_dir)
            .go_binary(&config.go_binary)
            .poll_interval(Duration::from_millis(config.poll_interval_ms))
            .exec_timeout(Duration::from_secs(config.exec_timeout_seconds))
            .build_timeout(Duration::from_secs(config.build_timeout_seconds))
            .prebuild_on_change(prebuild_debounce)
    }

    /// 工作目录，每个 Worker 使用其中以自己名称命名的子目录
    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn go_binary(mut self, go_binary: impl Into<String>) -> Self {
        self.go_binary = go_binary.into();
        self
    }

    /// 设置轮询间隔
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    pub fn build_timeout(mut self, build_timeout: Duration) -> Self {
        self.build_timeout = build_timeout;
        self
    }

    /// `Some(debounce)` 时监听源码变化并预构建
    pub fn prebuild_on_change(mut self, debounce: Option<Duration>) -> Self {
        self.prebuild_debounce = debounce;
        self
    }

    /// 构建Worker服务，启用预构建时需要在 tokio 运行时内调用
    pub fn build(self) -> FleetResult<WorkerService> {
        let work_dir = self.work_dir.join(self.identity.name());
        let builder = Arc::new(PackageBuilder::new(
            self.go_binary,
            self.build_timeout,
            work_dir.join("prebuild"),
        ));

        let mut registry = RepositoryRegistry::new(work_dir.join("mirrors"));
        if let Some(debounce) = self.prebuild_debounce {
            let watcher = SourceWatcher::start(Arc::clone(&builder), debounce)?;
            registry = registry.with_watcher(Arc::new(watcher));
        }

        Ok(WorkerService {
            identity: self.identity,
            source: self.source,
            registry: Arc::new(registry),
            builder,
            executor: TestExecutor::new(self.exec_timeout),
            work_dir,
            poll_interval: self.poll_interval,
        })
    }
}

/// 一个批次处理后的结果
struct Processed {
    report: ReportRequest,
    cancelled: bool,
}

/// 拉取批次、构建、执行、回报的 Worker 循环
pub struct WorkerService {
    identity: WorkerIdentity,
    source: Arc<dyn TaskSource>,
    registry: Arc<RepositoryRegistry>,
    builder: Arc<PackageBuilder>,
    executor: TestExecutor,
    work_dir: PathBuf,
    poll_interval: Duration,
}

impl WorkerService {
    pub fn builder(identity: WorkerIdentity, source: Arc<dyn TaskSource>) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(identity, source)
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry> {
        &self.registry
    }

    /// 循环处理批次，直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> FleetResult<()> {
        info!("Worker {} 启动，工作目录 {}", self.identity.name(), self.work_dir.display());
        tokio::fs::create_dir_all(&self.work_dir).await?;

        loop {
            if matches!(shutdown.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_))) {
                break;
            }

            match self.poll_once(&mut shutdown).await {
                Ok(Some(true)) => break,
                Ok(Some(false)) => continue,
                Ok(None) => {}
                Err(e) => warn!("Worker {} 拉取批次失败: {}", self.identity.name(), e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_signal(&mut shutdown) => break,
            }
        }

        self.builder.cancel_prebuilds();
        info!("Worker {} 已停止", self.identity.name());
        Ok(())
    }

    /// 拉取并处理一个批次
    ///
    /// 没有可运行的批次时返回 `None`，否则返回执行是否因关闭而中断。
    pub async fn poll_once(&self, shutdown: &mut broadcast::Receiver<()>) -> FleetResult<Option<bool>> {
        let Some(payload) = self.source.next_task_set(&self.identity).await? else {
            return Ok(None);
        };

        let span = info_span!("task_set", job_id = payload.job_id, task_set_id = payload.id);
        let processed = self.process(&payload, shutdown).instrument(span).await;

        if let Err(e) = self.source.report(processed.report).await {
            error!(
                "回报批次 {}/{} 失败: {}",
                payload.job_id, payload.id, e
            );
        }
        Ok(Some(processed.cancelled))
    }

    fn log_path(&self, payload: &TaskSetPayload) -> PathBuf {
        self.work_dir
            .join("logs")
            .join(format!("job-{}-set-{}.log", payload.job_id, payload.id))
    }

    async fn process(&self, payload: &TaskSetPayload, shutdown: &mut broadcast::Receiver<()>) -> Processed {
        info!(
            "处理批次: {} 个测试, 包 {}",
            payload.tasks.len(),
            payload.path
        );
        let log_path = self.log_path(payload);

        let (success, log, cancelled) = match self.build_and_run(payload, &log_path, shutdown).await {
            Ok(outcome) => outcome,
            Err(FleetError::BuildFailed { message, log }) => {
                error!("构建失败: {}", message);
                Self::save_log(&log_path, &log).await;
                (false, log, false)
            }
            Err(e) => {
                error!("批次执行失败: {}", e);
                let log = format!("testfleet: {e}\n");
                Self::save_log(&log_path, &log).await;
                (false, log, false)
            }
        };

        Processed {
            report: ReportRequest {
                job_id: payload.job_id,
                task_set_id: payload.id,
                success,
                log,
                log_path: Some(log_path.to_string_lossy().to_string()),
            },
            cancelled,
        }
    }

    /// 在仓库锁内同步镜像、构建并运行测试
    async fn build_and_run(
        &self,
        payload: &TaskSetPayload,
        log_path: &Path,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> FleetResult<(bool, String, bool)> {
        let tests = payload.test_names();
        if tests.is_empty() {
            debug!("空批次，直接记为成功");
            return Ok((true, String::new(), false));
        }

        let root = PathBuf::from(&payload.root);
        let repository = self.registry.watch(&root, false);
        let guard = repository.lock(self.identity.name()).await;

        // 从未同步过的镜像即使请求不要求同步也必须先同步
        if payload.sync || !guard.mirror().exists() {
            let stats = guard.sync_in_lock().await?;
            debug!(
                "镜像同步完成: 复制 {}, 未变 {}, 删除 {}",
                stats.copied, stats.unchanged, stats.deleted
            );
        }

        let package_dir = guard.mirrored_path(Path::new(&payload.path))?;
        let artifact = self
            .work_dir
            .join("bin")
            .join(format!("{}-{}.test", payload.job_id, payload.id));

        let binary = match self.builder.build(&package_dir, &payload.build_tags, &artifact).await? {
            BuildOutcome::Built(binary) => binary,
            skipped => {
                info!("包 {} 无需运行: {:?}", payload.path, skipped);
                let log = format!("testfleet: {skipped:?}\n");
                Self::save_log(log_path, &log).await;
                return Ok((true, log, false));
            }
        };

        let result = self
            .executor
            .execute(&binary, &package_dir, &tests, log_path, shutdown)
            .await;
        if let Err(e) = tokio::fs::remove_file(&binary).await {
            debug!("删除测试二进制 {} 失败: {}", binary.display(), e);
        }
        let result = result?;
        drop(guard);

        Ok((result.success, result.log, result.cancelled))
    }

    async fn save_log(log_path: &Path, log: &str) {
        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("无法创建日志目录 {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(log_path, log).await {
            warn!("写入日志 {} 失败: {}", log_path.display(), e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use testfleet_core::TaskPayload;

    #[derive(Default)]
    struct QueueSource {
        pending: Mutex<VecDeque<TaskSetPayload>>,
        reports: Mutex<Vec<ReportRequest>>,
    }

    impl QueueSource {
        fn with(payloads: Vec<TaskSetPayload>) -> Arc<Self> {
            Arc::new(Self {
                pending: Mutex::new(payloads.into()),
                reports: Mutex::new(Vec::new()),
            })
        }

        fn reports(&self) -> Vec<ReportRequest> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskSource for QueueSource {
        async fn next_task_set(&self, _worker: &WorkerIdentity) -> FleetResult<Option<TaskSetPayload>> {
            Ok(self.pending.lock().unwrap().pop_front())
        }

        async fn report(&self, report: ReportRequest) -> FleetResult<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn fake_go(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-go");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// 生成的“测试二进制”打印工作目录、参数和一行 PASS
    const BUILDS_PASSING_BINARY: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
printf '#!/bin/sh\necho "cwd: $(pwd)"\necho "args: $*"\ncat marker.txt\necho "--- PASS: TestSum (0.01s)"\n' > "$out"
chmod +x "$out""#;

    struct Fixture {
        dir: tempfile::TempDir,
        root: PathBuf,
        package: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let package = root.join("math");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("math.go"), "package math\n").unwrap();
        std::fs::write(package.join("marker.txt"), "mirrored marker\n").unwrap();
        Fixture { dir, root, package }
    }

    fn payload(fixture: &Fixture, tasks: &[&str]) -> TaskSetPayload {
        TaskSetPayload {
            id: 2,
            job_id: 7,
            path: fixture.package.to_string_lossy().to_string(),
            root: fixture.root.to_string_lossy().to_string(),
            build_tags: String::new(),
            sync: true,
            tasks: tasks
                .iter()
                .map(|name| TaskPayload { name: name.to_string() })
                .collect(),
        }
    }

    fn service(fixture: &Fixture, go_body: &str, source: Arc<QueueSource>) -> WorkerService {
        let go = fake_go(fixture.dir.path(), go_body);
        WorkerService::builder(WorkerIdentity::new("ci", 1), source)
            .work_dir(fixture.dir.path().join("work"))
            .go_binary(go.to_string_lossy().to_string())
            .poll_interval(Duration::from_millis(20))
            .exec_timeout(Duration::from_secs(10))
            .build_timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_batch_runs_in_synced_mirror() {
        let fixture = fixture();
        let source = QueueSource::with(vec![payload(&fixture, &["TestSum", "TestOther"])]);
        let service = service(&fixture, BUILDS_PASSING_BINARY, Arc::clone(&source));
        let (_tx, mut rx) = broadcast::channel(1);

        assert_eq!(service.poll_once(&mut rx).await.unwrap(), Some(false));

        let reports = source.reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!((report.job_id, report.task_set_id), (7, 2));
        assert!(report.success);
        assert!(report.log.contains("--- PASS: TestSum (0.01s)"));
        assert!(report.log.contains("args: -test.run ^(TestSum|TestOther)$ -test.v"));
        assert!(report.log.contains("mirrored marker"));

        let mirror = service.work_dir().join("mirrors");
        assert!(report.log.contains(&format!("cwd: {}", mirror.display())));
        let log_path = PathBuf::from(report.log_path.as_ref().unwrap());
        assert_eq!(log_path, service.work_dir().join("logs/job-7-set-2.log"));
        assert!(log_path.is_file());
    }

    #[tokio::test]
    async fn test_unsynced_batch_reuses_existing_mirror() {
        let fixture = fixture();
        let source = QueueSource::with(vec![
            payload(&fixture, &["TestSum"]),
            TaskSetPayload {
                id: 3,
                sync: false,
                ..payload(&fixture, &["TestSum"])
            },
            TaskSetPayload {
                id: 4,
                ..payload(&fixture, &["TestSum"])
            },
        ]);
        let service = service(&fixture, BUILDS_PASSING_BINARY, Arc::clone(&source));
        let (_tx, mut rx) = broadcast::channel(1);

        service.poll_once(&mut rx).await.unwrap();
        std::fs::write(fixture.package.join("marker.txt"), "updated marker\n").unwrap();
        service.poll_once(&mut rx).await.unwrap();
        service.poll_once(&mut rx).await.unwrap();

        let reports = source.reports();
        assert!(reports[0].log.contains("mirrored marker"));
        assert!(reports[1].log.contains("mirrored marker"));
        assert!(!reports[1].log.contains("updated marker"));
        assert!(reports[2].log.contains("updated marker"));
    }

    #[tokio::test]
    async fn test_unsynced_batch_still_syncs_missing_mirror() {
        let fixture = fixture();
        let source = QueueSource::with(vec![TaskSetPayload {
            sync: false,
            ..payload(&fixture, &["TestSum"])
        }]);
        let service = service(&fixture, BUILDS_PASSING_BINARY, Arc::clone(&source));
        let (_tx, mut rx) = broadcast::channel(1);

        service.poll_once(&mut rx).await.unwrap();

        let report = &source.reports()[0];
        assert!(report.success);
        assert!(report.log.contains("mirrored marker"));
    }

    #[tokio::test]
    async fn test_build_failure_reports_log() {
        let fixture = fixture();
        let source = QueueSource::with(vec![payload(&fixture, &["TestSum"])]);
        let service = service(
            &fixture,
            "echo '# example.com/m/math' 1>&2\necho './math.go:1:1: syntax error' 1>&2\nexit 2",
            Arc::clone(&source),
        );
        let (_tx, mut rx) = broadcast::channel(1);

        service.poll_once(&mut rx).await.unwrap();

        let report = &source.reports()[0];
        assert!(!report.success);
        assert!(report.log.contains("./math.go:1:1: syntax error"));
    }

    #[tokio::test]
    async fn test_no_test_files_is_trivial_success() {
        let fixture = fixture();
        let source = QueueSource::with(vec![payload(&fixture, &["TestSum"])]);
        let service = service(
            &fixture,
            "echo '?   \texample.com/m/math\t[no test files]'",
            Arc::clone(&source),
        );
        let (_tx, mut rx) = broadcast::channel(1);

        service.poll_once(&mut rx).await.unwrap();

        assert!(source.reports()[0].success);
    }

    #[tokio::test]
    async fn test_idle_poll_returns_none() {
        let fixture = fixture();
        let source = QueueSource::with(Vec::new());
        let service = service(&fixture, "exit 0", Arc::clone(&source));
        let (_tx, mut rx) = broadcast::channel(1);

        assert_eq!(service.poll_once(&mut rx).await.unwrap(), None);
        assert!(source.reports().is_empty());
    }

    #[tokio::test]
    async fn test_run_processes_queue_until_shutdown() {
        let fixture = fixture();
        let source = QueueSource::with(vec![
            payload(&fixture, &["TestSum"]),
            TaskSetPayload {
                id: 3,
                ..payload(&fixture, &["TestOther"])
            },
        ]);
        let service = Arc::new(service(&fixture, BUILDS_PASSING_BINARY, Arc::clone(&source)));
        let (tx, rx) = broadcast::channel(1);

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(rx).await })
        };

        for _ in 0..200 {
            if source.reports().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let ids: Vec<u64> = source.reports().iter().map(|r| r.task_set_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
