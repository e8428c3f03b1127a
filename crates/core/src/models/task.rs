use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 运行状态，作业、任务批次和单个测试共用
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[default]
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUCCESSFUL")]
    Successful,
    #[serde(rename = "FAILED")]
    Failed,
}

impl RunStatus {
    pub fn from_success(success: bool) -> Self {
        if success {
            RunStatus::Successful
        } else {
            RunStatus::Failed
        }
    }

    /// Successful 和 Failed 为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Successful | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Started => "STARTED",
            RunStatus::Successful => "SUCCESSFUL",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个测试函数的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 测试函数名，同时作为 `-test.run` 的匹配项
    pub name: String,
    /// 是否被本次变更影响
    pub affected: bool,
    pub status: RunStatus,
    pub duration: Duration,
}

impl Task {
    pub fn new(name: impl Into<String>, affected: bool) -> Self {
        Self {
            name: name.into(),
            affected,
            status: RunStatus::Pending,
            duration: Duration::ZERO,
        }
    }

    pub fn complete(&mut self, success: bool, duration: Duration) {
        self.status = RunStatus::from_success(success);
        self.duration = duration;
    }
}
