//! Worker 创建与销毁的具体实现

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use testfleet_core::{FleetError, FleetResult, WorkerHandle, WorkerLaunch, WorkerProvisioner};

fn is_local(host: &str) -> bool {
    host.is_empty() || host == "localhost" || host == "127.0.0.1"
}

/// Worker 进程或容器内使用的环境变量
pub fn worker_environment(launch: &WorkerLaunch) -> Vec<(String, String)> {
    vec![
        ("TESTFLEET_WORKER__GROUP".to_string(), launch.identity.group.clone()),
        ("TESTFLEET_WORKER__WORKER_ID".to_string(), launch.identity.id.to_string()),
        ("TESTFLEET_WORKER__SERVER_URL".to_string(), launch.server_address.clone()),
    ]
}

/// 通过 docker 命令行管理容器
pub struct DockerProvisioner {
    docker_binary: String,
}

impl Default for DockerProvisioner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerProvisioner {
    pub fn new(docker_binary: impl Into<String>) -> Self {
        Self {
            docker_binary: docker_binary.into(),
        }
    }

    fn host_args(host: &str) -> Vec<String> {
        if is_local(host) {
            Vec::new()
        } else {
            vec!["-H".to_string(), host.to_string()]
        }
    }

    pub fn run_args(launch: &WorkerLaunch) -> Vec<String> {
        let mut args = Self::host_args(&launch.host);
        args.extend([
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            launch.name.clone(),
            "--label".to_string(),
            format!("testfleet.group={}", launch.identity.group),
        ]);
        for (key, value) in worker_environment(launch) {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(launch.image.clone());
        args.extend(["--mode".to_string(), "worker".to_string()]);
        args
    }

    pub fn remove_args(handle: &WorkerHandle) -> Vec<String> {
        let mut args = Self::host_args(&handle.host);
        args.extend(["rm".to_string(), "-f".to_string(), handle.backend_id.clone()]);
        args
    }

    async fn docker(&self, args: &[String]) -> FleetResult<String> {
        debug!("{} {}", self.docker_binary, args.join(" "));
        let output = Command::new(&self.docker_binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FleetError::Provisioning(format!("无法执行 {}: {e}", self.docker_binary)))?;

        if !output.status.success() {
            return Err(FleetError::Provisioning(format!(
                "{} {} 失败: {}",
                self.docker_binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorkerProvisioner for DockerProvisioner {
    async fn start(&self, launch: &WorkerLaunch) -> FleetResult<WorkerHandle> {
        let container_id = self.docker(&Self::run_args(launch)).await?;
        if container_id.is_empty() {
            return Err(FleetError::Provisioning(format!(
                "容器 {} 没有返回ID",
                launch.name
            )));
        }
        info!("容器 {} 已启动: {}", launch.name, container_id);
        Ok(WorkerHandle {
            name: launch.name.clone(),
            host: launch.host.clone(),
            backend_id: container_id,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> FleetResult<()> {
        self.docker(&Self::remove_args(handle)).await?;
        info!("容器 {} 已删除", handle.name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// 在本机以子进程方式运行 Worker
pub struct LocalProcessProvisioner {
    executable: PathBuf,
    prefix_args: Vec<String>,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalProcessProvisioner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            prefix_args: Vec::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// 使用当前可执行文件
    pub fn current_exe() -> FleetResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// 放在 Worker 参数之前的参数
    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn worker_args(launch: &WorkerLaunch) -> Vec<String> {
        vec![
            "--mode".to_string(),
            "worker".to_string(),
            "--worker-group".to_string(),
            launch.identity.group.clone(),
            "--worker-id".to_string(),
            launch.identity.id.to_string(),
            "--server".to_string(),
            launch.server_address.clone(),
        ]
    }

    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[async_trait]
impl WorkerProvisioner for LocalProcessProvisioner {
    async fn start(&self, launch: &WorkerLaunch) -> FleetResult<WorkerHandle> {
        if !is_local(&launch.host) {
            return Err(FleetError::Provisioning(format!(
                "本地进程模式不支持远程主机 {}",
                launch.host
            )));
        }

        let child = Command::new(&self.executable)
            .args(&self.prefix_args)
            .args(Self::worker_args(launch))
            .envs(worker_environment(launch))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FleetError::Provisioning(format!("无法启动 {}: {e}", self.executable.display()))
            })?;

        let pid = child.id().map(|pid| pid.to_string()).unwrap_or_default();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| launch.host.clone());
        info!("Worker 进程 {} 已启动 (pid {})", launch.name, pid);

        self.children.lock().await.insert(launch.name.clone(), child);
        Ok(WorkerHandle {
            name: launch.name.clone(),
            host,
            backend_id: pid,
        })
    }

    async fn stop(&self, handle: &WorkerHandle) -> FleetResult<()> {
        let mut child = self
            .children
            .lock()
            .await
            .remove(&handle.name)
            .ok_or_else(|| FleetError::Provisioning(format!("未知的 Worker 进程 {}", handle.name)))?;

        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("Worker 进程 {} 已提前退出: {}", handle.name, status);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!("无法获取 Worker 进程 {} 状态: {}", handle.name, e),
        }

        child
            .kill()
            .await
            .map_err(|e| FleetError::Provisioning(format!("无法终止 {}: {e}", handle.name)))?;
        info!("Worker 进程 {} 已终止", handle.name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
