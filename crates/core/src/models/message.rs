use serde::{Deserialize, Serialize};

use super::{Job, JobId, TaskSet};

/// 请求中的一个编辑区间，闭区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub begin: usize,
    pub end: usize,
}

/// 测试请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub path: String,
    #[serde(default)]
    pub ranges: Vec<ByteRange>,
    #[serde(default)]
    pub build_tags: String,
    /// 跳过影响分析，包内所有测试都视为受影响
    #[serde(default)]
    pub bypass: bool,
    /// 为 false 时 Worker 直接复用已有镜像，不再同步源码
    #[serde(default = "default_sync")]
    pub sync: bool,
}

fn default_sync() -> bool {
    true
}

/// Worker 拉取任务批次的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub worker_group: String,
    pub worker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub name: String,
}

/// 下发给 Worker 的任务批次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSetPayload {
    pub id: u64,
    pub job_id: JobId,
    /// 包目录
    pub path: String,
    /// 仓库根目录
    pub root: String,
    #[serde(default)]
    pub build_tags: String,
    #[serde(default)]
    pub sync: bool,
    pub tasks: Vec<TaskPayload>,
}

impl TaskSetPayload {
    pub fn from_job(job: &Job, task_set: &TaskSet) -> Self {
        Self {
            id: task_set.id,
            job_id: job.id,
            path: job.directory.to_string_lossy().to_string(),
            root: job.root.to_string_lossy().to_string(),
            build_tags: job.build_tags.clone(),
            sync: job.sync,
            tasks: task_set
                .tasks
                .iter()
                .map(|name| TaskPayload { name: name.clone() })
                .collect(),
        }
    }

    pub fn test_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }
}

/// Worker 回报的执行结果，附带合并后的输出日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub job_id: JobId,
    pub task_set_id: u64,
    pub success: bool,
    #[serde(default)]
    pub log: String,
    /// Worker 本地保存完整日志的位置
    #[serde(default)]
    pub log_path: Option<String>,
}

/// 新增 Worker 的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddWorkerRequest {
    pub host: String,
    pub image: String,
}
