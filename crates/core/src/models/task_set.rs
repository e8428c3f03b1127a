use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RunStatus, WorkerIdentity};

/// 分配给单个Worker的一批测试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSet {
    /// 作业内唯一
    pub id: u64,
    /// 是否属于受影响层
    pub affected: bool,
    /// 测试名，和同一作业的其他批次互不相交
    pub tasks: Vec<String>,
    pub status: RunStatus,
    pub worker: Option<WorkerIdentity>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
}

impl TaskSet {
    pub fn new(id: u64, affected: bool, tasks: Vec<String>) -> Self {
        Self {
            id,
            affected,
            tasks,
            status: RunStatus::Pending,
            worker: None,
            started_at: None,
            finished_at: None,
            log_path: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn start(&mut self, worker: WorkerIdentity) {
        self.status = RunStatus::Started;
        self.worker = Some(worker);
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, success: bool) {
        self.status = RunStatus::from_success(success);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
