use thiserror::Error;

/// 测试调度系统错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    #[error("无效的源码位置: {path} 偏移量 {offset}")]
    InvalidLocation { path: String, offset: usize },

    #[error("无效的参数: {0}")]
    InvalidArgument(String),

    #[error("优先级深度越界: {depth} (上限 {max})")]
    DepthOutOfRange { depth: usize, max: usize },

    #[error("没有可运行的任务批次")]
    NoRunnableWork,

    #[error("作业未找到: {id}")]
    JobNotFound { id: u64 },

    #[error("任务批次未找到: job={job_id}, task_set={task_set_id}")]
    TaskSetNotFound { job_id: u64, task_set_id: u64 },

    #[error("构建失败: {message}")]
    BuildFailed { message: String, log: String },

    #[error("仓库同步失败: {0}")]
    RepositorySync(String),

    #[error("Worker调配失败: {0}")]
    Provisioning(String),

    #[error("源码解析错误: {0}")]
    Parse(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    /// 请求本身不合法，作业不会被创建
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            FleetError::InvalidRequest(_)
                | FleetError::InvalidLocation { .. }
                | FleetError::InvalidArgument(_)
        )
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;
