use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ByteRange;

/// 一处源码编辑区域，偏移量为闭区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: PathBuf,
    pub begin: usize,
    pub end: usize,
}

impl Change {
    pub fn new(path: impl Into<PathBuf>, begin: usize, end: usize) -> Self {
        Self {
            path: path.into(),
            begin,
            end,
        }
    }

    pub fn from_range(path: impl Into<PathBuf>, range: ByteRange) -> Self {
        Self::new(path, range.begin, range.end)
    }

    pub fn is_valid(&self) -> bool {
        self.begin <= self.end
    }
}
