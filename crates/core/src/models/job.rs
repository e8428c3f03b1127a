use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RunStatus, Task, TaskSet};

pub type JobId = u64;

/// 一次测试请求的完整执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Go 包目录
    pub directory: PathBuf,
    /// 仓库根目录
    pub root: PathBuf,
    pub build_tags: String,
    /// Worker 运行前是否需要同步仓库快照
    pub sync: bool,
    /// 距离被编辑代码的跳数，越小越先执行
    pub depth: usize,
    pub tasks: Vec<Task>,
    pub task_sets: Vec<TaskSet>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        directory: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        tasks: Vec<Task>,
        depth: usize,
    ) -> Self {
        Self {
            id,
            directory: directory.into(),
            root: root.into(),
            build_tags: String::new(),
            sync: true,
            depth,
            tasks,
            task_sets: Vec::new(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_build_tags(mut self, build_tags: impl Into<String>) -> Self {
        self.build_tags = build_tags.into();
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Profiler 使用的位置键
    pub fn location(&self) -> &Path {
        &self.directory
    }

    /// 所有批次都处于终止状态
    pub fn all_task_sets_terminal(&self) -> bool {
        self.task_sets.iter().all(TaskSet::is_terminal)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn task_set(&self, id: u64) -> Option<&TaskSet> {
        self.task_sets.iter().find(|set| set.id == id)
    }

    pub fn task_set_mut(&mut self, id: u64) -> Option<&mut TaskSet> {
        self.task_sets.iter_mut().find(|set| set.id == id)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.name == name)
    }

    /// 任意批次或测试失败则作业失败
    pub fn outcome(&self) -> RunStatus {
        let set_failed = self
            .task_sets
            .iter()
            .any(|set| set.status == RunStatus::Failed);
        let task_failed = self
            .tasks
            .iter()
            .any(|task| task.status == RunStatus::Failed);
        if set_failed || task_failed {
            RunStatus::Failed
        } else {
            RunStatus::Successful
        }
    }

    /// 终止作业，只生效一次
    pub fn finalize(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = self.outcome();
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|task| task.status == RunStatus::Failed)
            .map(|task| task.name.as_str())
            .collect()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            directory: self.directory.to_string_lossy().to_string(),
            status: self.status,
            depth: self.depth,
            total_tasks: self.tasks.len(),
            total_task_sets: self.task_sets.len(),
            finished_task_sets: self.task_sets.iter().filter(|s| s.is_terminal()).count(),
            created_at: self.created_at,
        }
    }
}

/// 作业概要，用于查询接口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub directory: String,
    pub status: RunStatus,
    pub depth: usize,
    pub total_tasks: usize,
    pub total_task_sets: usize,
    pub finished_task_sets: usize,
    pub created_at: DateTime<Utc>,
}
