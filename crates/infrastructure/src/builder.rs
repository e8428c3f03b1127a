//! Go 测试二进制构建

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use testfleet_core::{FleetError, FleetResult};

const NO_BUILDABLE_SOURCES: &str = "no buildable Go source files";
const NO_TEST_FILES: &str = "no test files";

/// 构建结果，`NoBuildableSources` 和 `NoTestSources` 视为可忽略的跳过
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(PathBuf),
    NoBuildableSources,
    NoTestSources,
}

impl BuildOutcome {
    pub fn artifact(&self) -> Option<&Path> {
        match self {
            BuildOutcome::Built(path) => Some(path),
            _ => None,
        }
    }
}

/// 根据 `go test -c` 的退出状态和输出判断结果
pub fn classify_build(success: bool, output: &str, artifact: &Path, artifact_exists: bool) -> FleetResult<BuildOutcome> {
    if output.contains(NO_BUILDABLE_SOURCES) {
        return Ok(BuildOutcome::NoBuildableSources);
    }
    if output.contains(NO_TEST_FILES) {
        return Ok(BuildOutcome::NoTestSources);
    }
    if success {
        // 没有测试文件时 go test -c 成功退出但不生成二进制
        if artifact_exists {
            return Ok(BuildOutcome::Built(artifact.to_path_buf()));
        }
        return Ok(BuildOutcome::NoTestSources);
    }

    let message = output
        .lines()
        .find(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .unwrap_or("go test -c 失败")
        .trim()
        .to_string();
    Err(FleetError::BuildFailed {
        message,
        log: output.to_string(),
    })
}

/// 编译包的测试二进制，并支持可取消的预构建
pub struct PackageBuilder {
    go_binary: String,
    build_timeout: Duration,
    scratch_dir: PathBuf,
    prebuilds: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
}

impl PackageBuilder {
    pub fn new(go_binary: impl Into<String>, build_timeout: Duration, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            go_binary: go_binary.into(),
            build_timeout,
            scratch_dir: scratch_dir.into(),
            prebuilds: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, package_dir: &Path, build_tags: &str, artifact: &Path, vet: bool) -> Command {
        let mut cmd = Command::new(&self.go_binary);
        cmd.arg("test").arg("-c").arg("-o").arg(artifact);
        if !vet {
            cmd.arg("-vet=off");
        }
        if !build_tags.trim().is_empty() {
            cmd.arg("-tags").arg(build_tags.trim());
        }
        cmd.arg(".")
            .current_dir(package_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, package_dir: &Path, artifact: &Path) -> FleetResult<BuildOutcome> {
        let started = Instant::now();
        let output = tokio::time::timeout(self.build_timeout, cmd.output())
            .await
            .map_err(|_| FleetError::BuildFailed {
                message: format!("构建超时 ({}s)", self.build_timeout.as_secs()),
                log: String::new(),
            })?
            .map_err(|e| {
                FleetError::TaskExecution(format!("无法启动 {}: {e}", self.go_binary))
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).to_string();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        let outcome = classify_build(output.status.success(), &log, artifact, artifact.is_file());
        debug!(
            "构建 {} 用时 {:?}: {:?}",
            package_dir.display(),
            started.elapsed(),
            outcome.as_ref().map_err(|e| e.to_string())
        );
        outcome
    }

    /// `go test -c -o artifact`，不会被预构建取消
    pub async fn build(&self, package_dir: &Path, build_tags: &str, artifact: &Path) -> FleetResult<BuildOutcome> {
        if let Some(parent) = artifact.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // 旧的二进制会让没有测试文件的包被误判为构建成功
        match tokio::fs::remove_file(artifact).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("构建测试二进制 {}", package_dir.display());
        let cmd = self.command(package_dir, build_tags, artifact, true);
        self.run(cmd, package_dir, artifact).await
    }

    fn prebuild_artifact(&self, package_dir: &Path) -> PathBuf {
        let name: String = package_dir
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.scratch_dir.join(format!("prebuild-{name}.test"))
    }

    /// 在后台预先编译依赖，同一个包的上一次预构建会被取消
    pub fn prebuild(self: &Arc<Self>, package_dir: &Path, build_tags: &str) {
        let package_dir = package_dir.to_path_buf();
        let artifact = self.prebuild_artifact(&package_dir);
        let cmd = self.command(&package_dir, build_tags, &artifact, false);

        let mut prebuilds = self.prebuilds.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = prebuilds.remove(&package_dir) {
            if !previous.is_finished() {
                debug!("取消 {} 的预构建", package_dir.display());
                previous.abort();
            }
        }

        let builder = Arc::clone(self);
        let key = package_dir.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&builder.scratch_dir).await {
                warn!("无法创建预构建目录 {}: {}", builder.scratch_dir.display(), e);
                return;
            }
            match builder.run(cmd, &package_dir, &artifact).await {
                Ok(outcome) => debug!("预构建 {} 完成: {:?}", package_dir.display(), outcome),
                Err(e) => debug!("预构建 {} 失败: {}", package_dir.display(), e),
            }
            let _ = tokio::fs::remove_file(&artifact).await;
        });
        prebuilds.insert(key, handle);
    }

    /// 仍在运行的预构建数量
    pub fn pending_prebuilds(&self) -> usize {
        let mut prebuilds = self.prebuilds.lock().unwrap_or_else(|e| e.into_inner());
        prebuilds.retain(|_, handle| !handle.is_finished());
        prebuilds.len()
    }

    pub fn cancel_prebuilds(&self) {
        let mut prebuilds = self.prebuilds.lock().unwrap_or_else(|e| e.into_inner());
        for (package_dir, handle) in prebuilds.drain() {
            if !handle.is_finished() {
                debug!("取消 {} 的预构建", package_dir.display());
                handle.abort();
            }
        }
    }
}

impl Drop for PackageBuilder {
    fn drop(&mut self) {
        self.cancel_prebuilds();
    }
}
