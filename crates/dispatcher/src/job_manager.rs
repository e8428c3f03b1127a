use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

use testfleet_analyzer::{ImpactAnalyzer, Package};
use testfleet_core::{
    Change, FleetError, FleetResult, Job, JobId, JobSummary, ReportRequest, RunStatus,
    SchedulerConfig, Task, TaskSetPayload, TaskSource, TestRequest, WorkerIdentity,
};

use crate::partitioner::Partitioner;
use crate::profiler::Profiler;
use crate::scheduler::{ScheduledTaskSet, Scheduler};

/// `go test -v` 的单个测试结果行
const RESULT_LINE_PATTERN: &str = r"(?m)^\s*--- (PASS|FAIL): (\S+) \(([0-9]+(?:\.[0-9]+)?)s\)";

fn result_line_regex() -> &'static Regex {
    static RESULT_LINE: OnceLock<Regex> = OnceLock::new();
    RESULT_LINE.get_or_init(|| Regex::new(RESULT_LINE_PATTERN).expect("结果行正则表达式无效"))
}

/// 从日志中解析出的单个测试结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub duration: Duration,
}

fn parse_seconds(text: &str) -> Option<Duration> {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    let secs: u64 = whole.parse().ok()?;
    let mut nanos: String = fraction.chars().take(9).collect();
    while nanos.len() < 9 {
        nanos.push('0');
    }
    Some(Duration::new(secs, nanos.parse().ok()?))
}

/// 解析 `--- PASS|FAIL: <name> (<secs>s)` 结果行，同名测试以最后一行为准
pub fn parse_results(log: &str) -> HashMap<String, TestOutcome> {
    result_line_regex()
        .captures_iter(log)
        .filter_map(|caps| {
            let duration = parse_seconds(&caps[3])?;
            Some((
                caps[2].to_string(),
                TestOutcome {
                    passed: &caps[1] == "PASS",
                    duration,
                },
            ))
        })
        .collect()
}

/// 作业结束时的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub directory: String,
    pub status: RunStatus,
    pub total_tasks: usize,
    pub failed_tasks: Vec<String>,
    pub elapsed_ms: u64,
}

impl JobReport {
    fn from_job(job: &Job) -> Self {
        let finished_at = job.finished_at.unwrap_or_else(Utc::now);
        Self {
            job_id: job.id,
            directory: job.directory.to_string_lossy().to_string(),
            status: job.status,
            total_tasks: job.tasks.len(),
            failed_tasks: job.failed_tasks().into_iter().map(str::to_string).collect(),
            elapsed_ms: (finished_at - job.created_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Successful
    }

    /// `go test` 风格的状态文本
    pub fn status_line(&self) -> String {
        let secs = self.elapsed_ms as f64 / 1000.0;
        if self.is_success() {
            return format!("ok  \t{}\t{:.3}s\n", self.directory, secs);
        }

        let mut text = String::new();
        for name in &self.failed_tasks {
            text.push_str(&format!("--- FAIL: {name}\n"));
        }
        text.push_str(&format!("FAIL\t{}\t{:.3}s\n", self.directory, secs));
        text
    }
}

/// 等待作业结束的句柄
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    receiver: watch::Receiver<Option<JobReport>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// 作业已结束时立即返回
    pub async fn wait(mut self) -> FleetResult<JobReport> {
        let id = self.id;
        let report = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FleetError::Internal(format!("作业 {id} 在结束前被丢弃")))?;
        report
            .clone()
            .ok_or_else(|| FleetError::Internal(format!("作业 {id} 没有结果")))
    }
}

struct JobEntry {
    job: Job,
    completion: watch::Sender<Option<JobReport>>,
}

/// 请求对应的包目录、被编辑文件和仓库根目录
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    directory: PathBuf,
    file: Option<PathBuf>,
    root: PathBuf,
}

/// 优先使用包含 `.git` 的祖先目录，其次是最近的 `go.mod`
fn find_repository_root(directory: &Path) -> PathBuf {
    if let Some(git_root) = directory.ancestors().find(|dir| dir.join(".git").exists()) {
        return git_root.to_path_buf();
    }
    directory
        .ancestors()
        .find(|dir| dir.join("go.mod").is_file())
        .unwrap_or(directory)
        .to_path_buf()
}

fn resolve_target(request: &TestRequest) -> FleetResult<Target> {
    if request.path.trim().is_empty() {
        return Err(FleetError::InvalidRequest("缺少 path".to_string()));
    }
    if let Some(range) = request.ranges.iter().find(|r| r.begin > r.end) {
        return Err(FleetError::InvalidRequest(format!(
            "编辑区间无效: {}..={}",
            range.begin, range.end
        )));
    }

    let path = PathBuf::from(&request.path);
    if !path.is_absolute() {
        return Err(FleetError::InvalidRequest(format!(
            "path 必须是绝对路径: {}",
            request.path
        )));
    }
    let metadata = std::fs::metadata(&path)
        .map_err(|e| FleetError::InvalidRequest(format!("无法访问 {}: {e}", request.path)))?;

    let (directory, file) = if metadata.is_dir() {
        if !request.ranges.is_empty() && !request.bypass {
            return Err(FleetError::InvalidRequest(
                "编辑区间必须针对单个 Go 源文件".to_string(),
            ));
        }
        (path, None)
    } else {
        if path.extension().and_then(|e| e.to_str()) != Some("go") {
            return Err(FleetError::InvalidRequest(format!(
                "不是 Go 源文件: {}",
                request.path
            )));
        }
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| FleetError::InvalidRequest(format!("无效的文件路径: {}", request.path)))?;
        (directory, Some(path))
    };

    let root = find_repository_root(&directory);
    Ok(Target {
        directory,
        file,
        root,
    })
}

/// 作业管理器
///
/// 负责请求 → 作业 → 影响分析 → 切分 → 入队的完整流程，并汇总 Worker 回报的结果。
pub struct JobManager {
    next_job_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    scheduler: Arc<Scheduler>,
    profiler: Arc<Profiler>,
    partitioner: Partitioner,
    analyzer: ImpactAnalyzer,
    batches_per_job: i64,
}

impl JobManager {
    pub fn new(config: &SchedulerConfig, scheduler: Arc<Scheduler>, profiler: Arc<Profiler>) -> Self {
        Self {
            next_job_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
            partitioner: Partitioner::new(profiler.clone()),
            analyzer: ImpactAnalyzer::new(config.max_analysis_depth),
            batches_per_job: config.batches_per_job,
            scheduler,
            profiler,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_job_id(&self) -> JobId {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    /// 未受影响的批次进入最低优先级层
    pub fn unaffected_depth(&self) -> usize {
        self.scheduler.max_depth() - 1
    }

    /// 切分并入队一个作业
    ///
    /// 空批次直接标记成功；所有批次都已结束时作业立即完成。
    pub fn add_job(&self, mut job: Job) -> FleetResult<JobHandle> {
        if job.depth >= self.scheduler.max_depth() {
            return Err(FleetError::DepthOutOfRange {
                depth: job.depth,
                max: self.scheduler.max_depth(),
            });
        }

        let mut task_sets =
            self.partitioner
                .partition(job.location(), &job.tasks, self.batches_per_job)?;
        for set in task_sets.iter_mut().filter(|set| set.is_empty()) {
            set.finish(true);
        }
        job.task_sets = task_sets;

        let (completion, receiver) = watch::channel(None);
        let handle = JobHandle {
            id: job.id,
            receiver,
        };

        let unaffected_depth = self.unaffected_depth();
        let pending: Vec<(u64, usize)> = job
            .task_sets
            .iter()
            .filter(|set| !set.is_terminal())
            .map(|set| {
                let depth = if set.affected {
                    job.depth
                } else {
                    unaffected_depth
                };
                (set.id, depth)
            })
            .collect();

        if pending.is_empty() {
            job.finalize();
            let report = JobReport::from_job(&job);
            info!("作业 {} 没有需要运行的测试，直接完成", job.id);
            completion.send_replace(Some(report));
            return Ok(handle);
        }

        let job_id = job.id;
        info!(
            "作业 {} 已创建: {} 个测试, {} 个待运行批次, 深度 {}",
            job_id,
            job.tasks.len(),
            pending.len(),
            job.depth
        );
        job.status = RunStatus::Started;
        self.jobs().insert(job_id, JobEntry { job, completion });

        for (task_set_id, depth) in pending {
            self.scheduler
                .add(ScheduledTaskSet::new(job_id, task_set_id), depth)?;
        }

        Ok(handle)
    }

    /// 为 Worker 取出下一个批次；没有批次时返回 [`FleetError::NoRunnableWork`]
    pub fn next_task_set(&self, worker: &WorkerIdentity) -> FleetResult<TaskSetPayload> {
        loop {
            let item = self.scheduler.next()?;
            let mut jobs = self.jobs();

            let Some(entry) = jobs.get_mut(&item.job_id) else {
                warn!("作业 {} 已不存在，丢弃批次 {}", item.job_id, item.task_set_id);
                continue;
            };
            let job = &mut entry.job;
            let Some(set) = job.task_set_mut(item.task_set_id) else {
                warn!("作业 {} 中没有批次 {}", item.job_id, item.task_set_id);
                continue;
            };
            if set.is_empty() || set.is_terminal() {
                debug!("跳过批次 {}/{}", item.job_id, item.task_set_id);
                continue;
            }

            set.start(worker.clone());
            let snapshot = set.clone();
            info!(
                "批次 {}/{} ({} 个测试) 分配给 Worker {}",
                item.job_id,
                item.task_set_id,
                snapshot.tasks.len(),
                worker
            );
            return Ok(TaskSetPayload::from_job(job, &snapshot));
        }
    }

    /// 处理批次结果
    ///
    /// 日志中有结果行的测试使用自己的结果和耗时，并更新 Profiler；
    /// 没有结果行的测试沿用批次结果，耗时记为 0。
    pub fn report_result(
        &self,
        job_id: JobId,
        task_set_id: u64,
        success: bool,
        log: &str,
    ) -> FleetResult<()> {
        self.apply_report(job_id, task_set_id, success, log, None)
    }

    pub fn handle_report(&self, report: &ReportRequest) -> FleetResult<()> {
        self.apply_report(
            report.job_id,
            report.task_set_id,
            report.success,
            &report.log,
            report.log_path.clone(),
        )
    }

    fn apply_report(
        &self,
        job_id: JobId,
        task_set_id: u64,
        success: bool,
        log: &str,
        log_path: Option<String>,
    ) -> FleetResult<()> {
        let span = info_span!("report_result", job_id, task_set_id);
        let _guard = span.enter();

        let results = parse_results(log);

        let finished = {
            let mut jobs = self.jobs();
            let entry = jobs
                .get_mut(&job_id)
                .ok_or(FleetError::JobNotFound { id: job_id })?;
            let job = &mut entry.job;
            let location = job.directory.clone();

            let set = job
                .task_set_mut(task_set_id)
                .ok_or(FleetError::TaskSetNotFound {
                    job_id,
                    task_set_id,
                })?;
            if set.is_terminal() {
                warn!("批次 {}/{} 已结束，忽略重复回报", job_id, task_set_id);
                return Ok(());
            }
            set.finish(success);
            set.log_path = log_path;
            let names = set.tasks.clone();

            let mut degraded = Vec::new();
            for name in &names {
                let Some(task) = job.task_mut(name) else {
                    warn!("作业 {} 中没有测试 {}", job_id, name);
                    continue;
                };
                match results.get(name) {
                    Some(outcome) => {
                        task.complete(outcome.passed, outcome.duration);
                        self.profiler.add(&location, name, outcome.duration);
                    }
                    None => {
                        task.complete(success, Duration::ZERO);
                        degraded.push(name.as_str());
                    }
                }
            }
            if !degraded.is_empty() {
                warn!(
                    "批次 {}/{} 中 {} 个测试没有结果行，沿用批次结果 {}: {:?}",
                    job_id,
                    task_set_id,
                    degraded.len(),
                    success,
                    degraded
                );
            }
            info!(
                "批次 {}/{} 已完成: success={}, 解析到 {} 条结果",
                job_id,
                task_set_id,
                success,
                results.len()
            );

            if job.all_task_sets_terminal() {
                jobs.remove(&job_id)
            } else {
                None
            }
        };

        if let Some(mut entry) = finished {
            if entry.job.finalize() {
                let report = JobReport::from_job(&entry.job);
                info!(
                    "作业 {} 已结束: {}, 失败测试 {}",
                    job_id,
                    report.status,
                    report.failed_tasks.len()
                );
                entry.completion.send_replace(Some(report));
            }
        }

        Ok(())
    }

    /// 校验请求、分析影响并创建作业
    pub async fn submit(&self, request: TestRequest) -> FleetResult<JobHandle> {
        let target = resolve_target(&request)?;
        let changes: Vec<Change> = match &target.file {
            Some(file) => request
                .ranges
                .iter()
                .map(|range| Change::from_range(file.clone(), *range))
                .collect(),
            None => Vec::new(),
        };

        let analyzer = self.analyzer.clone();
        let directory = target.directory.clone();
        let bypass = request.bypass;
        let (tests, affected, depth) = tokio::task::spawn_blocking(
            move || -> FleetResult<(Vec<String>, HashSet<String>, usize)> {
                let package = Package::load(&directory)?;
                let tests = analyzer.list_tests(&package);
                if bypass {
                    let affected = tests.iter().cloned().collect();
                    return Ok((tests, affected, 0));
                }
                let impact = analyzer.analyze(&package, &changes);
                let depth = impact.depth();
                Ok((tests, impact.tests.into_keys().collect(), depth))
            },
        )
        .await
        .map_err(|e| FleetError::Internal(format!("影响分析任务异常: {e}")))??;

        let tasks: Vec<Task> = tests
            .iter()
            .map(|name| Task::new(name.as_str(), affected.contains(name)))
            .collect();
        let job = Job::new(
            self.next_job_id(),
            target.directory,
            target.root,
            tasks,
            depth,
        )
        .with_build_tags(request.build_tags)
        .with_sync(request.sync);

        info!(
            "收到测试请求 {}: {} 个测试, {} 个受影响 (bypass={})",
            request.path,
            tests.len(),
            affected.len(),
            bypass
        );
        self.add_job(job)
    }

    pub fn active_jobs(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> =
            self.jobs().values().map(|entry| entry.job.summary()).collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    pub fn job(&self, id: JobId) -> FleetResult<Job> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(FleetError::JobNotFound { id })
    }
}

#[async_trait]
impl TaskSource for JobManager {
    async fn next_task_set(&self, worker: &WorkerIdentity) -> FleetResult<Option<TaskSetPayload>> {
        match JobManager::next_task_set(self, worker) {
            Ok(payload) => Ok(Some(payload)),
            Err(FleetError::NoRunnableWork) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn report(&self, report: ReportRequest) -> FleetResult<()> {
        self.handle_report(&report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testfleet_core::ByteRange;

    #[test]
    fn test_parse_results() {
        let log = "=== RUN   TestX\n--- FAIL: TestX (0.01s)\n    x_test.go:9: boom\n=== RUN   TestY\n--- PASS: TestY (1.5s)\n    --- PASS: TestY/sub (0.00s)\nFAIL\n";
        let results = parse_results(log);

        assert_eq!(
            results.get("TestX"),
            Some(&TestOutcome {
                passed: false,
                duration: Duration::from_millis(10)
            })
        );
        assert_eq!(results["TestY"].duration, Duration::from_millis(1500));
        assert!(results["TestY"].passed);
        assert!(results.contains_key("TestY/sub"));
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("0.01"), Some(Duration::from_millis(10)));
        assert_eq!(parse_seconds("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_seconds("x"), None);
    }

    #[test]
    fn test_status_line() {
        let ok = JobReport {
            job_id: 1,
            directory: "/repo/math".to_string(),
            status: RunStatus::Successful,
            total_tasks: 2,
            failed_tasks: vec![],
            elapsed_ms: 1250,
        };
        assert_eq!(ok.status_line(), "ok  \t/repo/math\t1.250s\n");

        let failed = JobReport {
            status: RunStatus::Failed,
            failed_tasks: vec!["TestX".to_string()],
            ..ok
        };
        assert!(failed.status_line().starts_with("--- FAIL: TestX\nFAIL\t/repo/math"));
    }

    fn request(path: &str) -> TestRequest {
        TestRequest {
            path: path.to_string(),
            ranges: vec![],
            build_tags: String::new(),
            bypass: false,
            sync: true,
        }
    }

    #[test]
    fn test_resolve_target_rejects_bad_requests() {
        assert!(resolve_target(&request("")).is_err());
        assert!(resolve_target(&request("relative/pkg")).is_err());
        assert!(resolve_target(&request("/nonexistent/testfleet/pkg")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let mut with_ranges = request(dir.path().to_str().unwrap());
        with_ranges.ranges = vec![ByteRange { begin: 0, end: 3 }];
        assert!(resolve_target(&with_ranges).is_err());

        let mut inverted = request(dir.path().to_str().unwrap());
        inverted.ranges = vec![ByteRange { begin: 5, end: 3 }];
        assert!(resolve_target(&inverted).unwrap_err().is_request_error());
    }

    #[test]
    fn test_resolve_target_finds_module_root() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("math");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example.com/m\n").unwrap();
        std::fs::write(pkg.join("math.go"), "package math\n").unwrap();

        let target = resolve_target(&request(pkg.join("math.go").to_str().unwrap())).unwrap();

        assert_eq!(target.directory, pkg);
        assert_eq!(target.file, Some(pkg.join("math.go")));
        assert_eq!(target.root, dir.path());
    }
}
