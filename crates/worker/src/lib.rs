//! Worker：拉取任务批次，在仓库镜像中构建并运行 Go 测试，回报结果

pub mod dispatcher_client;
pub mod executor;
pub mod service;

pub use dispatcher_client::DispatcherClient;
pub use executor::{run_pattern, ExecutionResult, TestExecutor};
pub use service::{WorkerService, WorkerServiceBuilder};
