use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 优先级层数
    pub max_depth: usize,
    /// 每个作业每一层切分的批次数
    pub batches_per_job: i64,
    /// 影响分析沿非测试代码追踪的最大跳数
    pub max_analysis_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            batches_per_job: 4,
            max_analysis_depth: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_depth < 2 {
            return Err(anyhow::anyhow!("优先级层数至少为2"));
        }

        if self.batches_per_job <= 0 {
            return Err(anyhow::anyhow!("每个作业的批次数必须大于0"));
        }

        // 最后一层留给未受影响的测试
        if self.max_analysis_depth + 1 >= self.max_depth {
            return Err(anyhow::anyhow!(
                "影响分析深度 {} 必须小于优先级层数减一 ({})",
                self.max_analysis_depth,
                self.max_depth - 1
            ));
        }

        Ok(())
    }

    /// 未受影响测试所在的层
    pub fn unaffected_depth(&self) -> usize {
        self.max_depth - 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub group: String,
    pub worker_id: u32,
    pub server_url: String,
    /// 镜像、测试二进制和日志的存放目录
    pub work_dir: String,
    pub go_binary: String,
    pub poll_interval_ms: u64,
    pub exec_timeout_seconds: u64,
    pub build_timeout_seconds: u64,
    /// 源码变化后预先编译对应的包
    #[serde(default = "default_prebuild_on_change")]
    pub prebuild_on_change: bool,
    #[serde(default = "default_prebuild_debounce_ms")]
    pub prebuild_debounce_ms: u64,
}

fn default_prebuild_on_change() -> bool {
    true
}

fn default_prebuild_debounce_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            worker_id: 0,
            server_url: "http://127.0.0.1:7878".to_string(),
            work_dir: std::env::temp_dir()
                .join("testfleet")
                .to_string_lossy()
                .to_string(),
            go_binary: "go".to_string(),
            poll_interval_ms: 500,
            exec_timeout_seconds: 600,
            build_timeout_seconds: 600,
            prebuild_on_change: default_prebuild_on_change(),
            prebuild_debounce_ms: default_prebuild_debounce_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.group.is_empty() {
            return Err(anyhow::anyhow!("Worker分组不能为空"));
        }

        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(anyhow::anyhow!("调度服务地址格式无效: {}", self.server_url));
        }

        if self.work_dir.is_empty() {
            return Err(anyhow::anyhow!("工作目录不能为空"));
        }

        if self.go_binary.is_empty() {
            return Err(anyhow::anyhow!("Go可执行文件不能为空"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.exec_timeout_seconds == 0 || self.build_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("执行和构建超时时间必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    /// 以本机子进程运行 Worker
    Local,
    /// 通过 docker 命令行创建容器
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub group: String,
    pub provisioner: ProvisionerKind,
    pub image: String,
    pub host: String,
    /// 启动时创建的 Worker 数量
    pub initial_workers: usize,
    /// Worker 回连调度服务使用的地址
    pub advertise_address: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            provisioner: ProvisionerKind::Local,
            image: "testfleet-worker:latest".to_string(),
            host: "localhost".to_string(),
            initial_workers: 0,
            advertise_address: "http://127.0.0.1:7878".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.group.is_empty() {
            return Err(anyhow::anyhow!("Worker池分组不能为空"));
        }

        if self.provisioner == ProvisionerKind::Docker && self.image.is_empty() {
            return Err(anyhow::anyhow!("Docker模式下镜像不能为空"));
        }

        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Worker主机不能为空"));
        }

        Ok(())
    }
}
