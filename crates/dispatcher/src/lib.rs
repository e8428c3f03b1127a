//! 调度服务核心组件
//!
//! - [`profiler`]: 测试耗时记录
//! - [`partitioner`]: 按耗时做 LPT 装箱，生成任务批次
//! - [`scheduler`]: 按深度分层的批次队列
//! - [`job_manager`]: 作业生命周期与结果汇总
//! - [`pool`]: Worker 池的创建与销毁

pub mod job_manager;
pub mod partitioner;
pub mod pool;
pub mod profiler;
pub mod scheduler;

pub use job_manager::{parse_results, JobHandle, JobManager, JobReport, TestOutcome};
pub use partitioner::{pack, Bin, Partitioner};
pub use pool::{TeardownSummary, WorkerPool};
pub use profiler::{Profiler, UNKNOWN_DURATION};
pub use scheduler::{ScheduledTaskSet, Scheduler, DEFAULT_MAX_DEPTH};
