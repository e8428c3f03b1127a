use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

/// 未知测试的耗时
pub const UNKNOWN_DURATION: Duration = Duration::ZERO;

/// 记录每个 (包位置, 测试名) 最近一次的执行耗时
///
/// 只作为切分批次时的参考，后写覆盖先写，不会过期。
#[derive(Debug, Default)]
pub struct Profiler {
    entries: Mutex<HashMap<(PathBuf, String), Duration>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, location: &Path, name: &str, duration: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((location.to_path_buf(), name.to_string()), duration);
        debug!("记录测试耗时 {}:{} = {:?}", location.display(), name, duration);
    }

    /// 没有记录时返回 [`UNKNOWN_DURATION`]
    pub fn lookup(&self, location: &Path, name: &str) -> Duration {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&(location.to_path_buf(), name.to_string()))
            .copied()
            .unwrap_or(UNKNOWN_DURATION)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_then_lookup() {
        let profiler = Profiler::new();
        let location = Path::new("/repo/math");
        profiler.add(location, "TestSum", Duration::from_millis(120));

        assert_eq!(profiler.lookup(location, "TestSum"), Duration::from_millis(120));
        assert_eq!(profiler.len(), 1);
    }

    #[test]
    fn test_unknown_returns_sentinel() {
        let profiler = Profiler::new();
        profiler.add(Path::new("/repo/math"), "TestSum", Duration::from_secs(1));

        assert_eq!(profiler.lookup(Path::new("/repo/math"), "TestOther"), UNKNOWN_DURATION);
        assert_eq!(profiler.lookup(Path::new("/repo/strings"), "TestSum"), UNKNOWN_DURATION);
    }

    #[test]
    fn test_last_write_wins() {
        let profiler = Profiler::new();
        let location = Path::new("/repo/math");
        profiler.add(location, "TestSum", Duration::from_secs(3));
        profiler.add(location, "TestSum", Duration::from_millis(5));

        assert_eq!(profiler.lookup(location, "TestSum"), Duration::from_millis(5));
    }

    #[test]
    fn test_concurrent_writers() {
        let profiler = Arc::new(Profiler::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let profiler = profiler.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        profiler.add(
                            Path::new("/repo"),
                            &format!("Test{i}_{j}"),
                            Duration::from_millis(j),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(profiler.len(), 400);
    }
}
