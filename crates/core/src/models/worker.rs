use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 领取任务批次的Worker身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub group: String,
    pub id: u32,
}

impl WorkerIdentity {
    pub fn new(group: impl Into<String>, id: u32) -> Self {
        Self {
            group: group.into(),
            id,
        }
    }

    /// 组内确定的、补零的顺序名称
    pub fn name(&self) -> String {
        format!("{}-worker-{:03}", self.group, self.id)
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.id)
    }
}

/// Worker节点信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub identity: WorkerIdentity,
    pub name: String,
    pub host: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}
