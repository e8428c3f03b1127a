use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, warn};

use testfleet_core::{FleetError, FleetResult};

/// `-test.run` 参数：只匹配给定的顶层测试
pub fn run_pattern(names: &[&str]) -> String {
    let alternatives: Vec<String> = names.iter().map(|name| regex::escape(name)).collect();
    format!("^({})$", alternatives.join("|"))
}

/// 测试二进制的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub log_path: PathBuf,
    /// stdout 和 stderr 合并后的完整输出
    pub log: String,
    pub duration: Duration,
}

/// 发送端全部关闭时不视为关闭信号
pub(crate) async fn shutdown_signal(shutdown: &mut broadcast::Receiver<()>) {
    if let Err(broadcast::error::RecvError::Closed) = shutdown.recv().await {
        std::future::pending::<()>().await;
    }
}

enum Ending {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// 运行编译好的测试二进制
#[derive(Debug, Clone)]
pub struct TestExecutor {
    timeout: Duration,
}

impl TestExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 运行 `binary -test.run '^(A|B)$' -test.v`，输出写入 `log_path`
    ///
    /// 超时或收到关闭信号时终止进程，结果记为失败。
    pub async fn execute(
        &self,
        binary: &Path,
        working_dir: &Path,
        tests: &[&str],
        log_path: &Path,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> FleetResult<ExecutionResult> {
        if tests.is_empty() {
            return Err(FleetError::InvalidArgument("批次中没有测试".to_string()));
        }
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let log_file = std::fs::File::create(log_path)?;
        let stderr_file = log_file.try_clone()?;
        let pattern = run_pattern(tests);

        info!(
            "运行 {} 个测试: {} (日志 {})",
            tests.len(),
            binary.display(),
            log_path.display()
        );
        let started = Instant::now();
        let mut child = Command::new(binary)
            .arg("-test.run")
            .arg(&pattern)
            .arg("-test.v")
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::TaskExecution(format!("无法启动 {}: {e}", binary.display())))?;

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            _ = tokio::time::sleep(self.timeout) => Ending::TimedOut,
            _ = shutdown_signal(shutdown) => Ending::Cancelled,
        };

        let (success, exit_code, timed_out, cancelled) = match ending {
            Ending::Exited(status) => (status.success(), status.code(), false, false),
            Ending::TimedOut => {
                warn!("测试运行超过 {:?}，终止进程", self.timeout);
                Self::terminate(&mut child).await;
                Self::append(log_path, &format!("\ntestfleet: 超时 ({:?})，进程已终止\n", self.timeout)).await;
                (false, None, true, false)
            }
            Ending::Cancelled => {
                warn!("收到关闭信号，终止测试进程");
                Self::terminate(&mut child).await;
                Self::append(log_path, "\ntestfleet: Worker 关闭，进程已终止\n").await;
                (false, None, false, true)
            }
        };

        let bytes = tokio::fs::read(log_path).await?;
        let duration = started.elapsed();
        info!(
            "测试进程结束: success={}, exit_code={:?}, 用时 {:?}",
            success, exit_code, duration
        );

        Ok(ExecutionResult {
            success,
            exit_code,
            timed_out,
            cancelled,
            log_path: log_path.to_path_buf(),
            log: String::from_utf8_lossy(&bytes).to_string(),
            duration,
        })
    }

    async fn terminate(child: &mut tokio::process::Child) {
        if let Err(e) = child.kill().await {
            warn!("终止测试进程失败: {}", e);
        }
    }

    async fn append(log_path: &Path, text: &str) {
        let file = tokio::fs::OpenOptions::new().append(true).open(log_path).await;
        match file {
            Ok(mut file) => {
                if let Err(e) = file.write_all(text.as_bytes()).await {
                    warn!("写入日志 {} 失败: {}", log_path.display(), e);
                }
            }
            Err(e) => warn!("打开日志 {} 失败: {}", log_path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_pattern_is_anchored_and_escaped() {
        assert_eq!(run_pattern(&["TestA", "TestB"]), "^(TestA|TestB)$");
        assert_eq!(run_pattern(&["Test_x.y"]), r"^(Test_x\.y)$");
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("pkg.test");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_combined_output_and_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(
            dir.path(),
            r#"echo "args: $*"
echo "--- PASS: TestA (0.01s)"
echo "stderr line" 1>&2
exit 1"#,
        );
        let (_tx, mut rx) = broadcast::channel(1);
        let executor = TestExecutor::new(Duration::from_secs(10));
        let log_path = dir.path().join("logs/batch.log");

        let result = executor
            .execute(&binary, dir.path(), &["TestA", "TestB"], &log_path, &mut rx)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.log.contains("args: -test.run ^(TestA|TestB)$ -test.v"));
        assert!(result.log.contains("--- PASS: TestA (0.01s)"));
        assert!(result.log.contains("stderr line"));
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), result.log);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "echo started\nexec sleep 30");
        let (_tx, mut rx) = broadcast::channel(1);
        let executor = TestExecutor::new(Duration::from_millis(200));

        let result = executor
            .execute(&binary, dir.path(), &["TestSlow"], &dir.path().join("slow.log"), &mut rx)
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.success);
        assert!(result.log.contains("started"));
        assert!(result.duration < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "exec sleep 30");
        let (tx, mut rx) = broadcast::channel(1);
        let executor = TestExecutor::new(Duration::from_secs(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(());
        });
        let result = executor
            .execute(&binary, dir.path(), &["TestA"], &dir.path().join("a.log"), &mut rx)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, mut rx) = broadcast::channel(1);
        let executor = TestExecutor::new(Duration::from_secs(1));

        let err = executor
            .execute(Path::new("/bin/true"), dir.path(), &[], &dir.path().join("x.log"), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
    }
}
