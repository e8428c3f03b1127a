//! # 数据模型
//!
//! 定义测试调度系统的核心数据结构：变更、测试任务、任务批次、作业以及
//! Worker 与调度服务之间传输的消息。
//!
//! ## 状态流转
//!
//! ```text
//! Pending → Started → Successful
//!                  ↘ Failed
//! ```
//!
//! 空批次在创建时直接进入 `Successful`，不会经过调度。

pub mod change;
pub mod job;
pub mod message;
pub mod task;
pub mod task_set;
pub mod worker;

pub use change::*;
pub use job::*;
pub use message::*;
pub use task::*;
pub use task_set::*;
pub use worker::*;
