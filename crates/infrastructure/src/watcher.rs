//! 源码变化监听，变化的 Go 包会在防抖后触发预构建

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use testfleet_core::{FleetError, FleetResult};

use crate::builder::PackageBuilder;

/// 事件中变化的 Go 源文件所在的包目录
pub fn changed_packages(event: &Event) -> Vec<PathBuf> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Remove(RemoveKind::File)
            | EventKind::Remove(RemoveKind::Any)
    );
    if !relevant {
        return Vec::new();
    }

    let mut packages = Vec::new();
    for path in &event.paths {
        let is_go = path.extension().and_then(|e| e.to_str()) == Some("go");
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if !is_go || hidden {
            continue;
        }
        if let Some(parent) = path.parent() {
            if !packages.iter().any(|p: &PathBuf| p == parent) {
                packages.push(parent.to_path_buf());
            }
        }
    }
    packages
}

/// 监听源码根目录，并对变化的包做防抖预构建
pub struct SourceWatcher {
    watcher: Mutex<RecommendedWatcher>,
    roots: Mutex<HashSet<PathBuf>>,
    debounce_task: JoinHandle<()>,
}

impl SourceWatcher {
    pub fn start(builder: Arc<PackageBuilder>, debounce: Duration) -> FleetResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for package in changed_packages(&event) {
                    let _ = tx.send(package);
                }
            }
            Err(e) => warn!("源码监听错误: {}", e),
        })
        .map_err(|e| FleetError::Internal(format!("无法创建源码监听器: {e}")))?;

        let debounce_task = tokio::spawn(debounce_loop(rx, builder, debounce));

        Ok(Self {
            watcher: Mutex::new(watcher),
            roots: Mutex::new(HashSet::new()),
            debounce_task,
        })
    }

    pub fn watch_root(&self, root: &Path) -> FleetResult<()> {
        let mut roots = self.roots.lock().unwrap_or_else(|e| e.into_inner());
        if roots.contains(root) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| FleetError::Internal(format!("无法监听 {}: {e}", root.display())))?;
        roots.insert(root.to_path_buf());
        info!("开始监听源码目录 {}", root.display());
        Ok(())
    }

    pub fn unwatch_root(&self, root: &Path) {
        let mut roots = self.roots.lock().unwrap_or_else(|e| e.into_inner());
        if roots.remove(root) {
            if let Err(e) = self
                .watcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwatch(root)
            {
                debug!("取消监听 {} 失败: {}", root.display(), e);
            }
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.debounce_task.abort();
    }
}

/// 收集变化的包，安静 `debounce` 之后统一触发预构建
async fn debounce_loop(mut rx: mpsc::UnboundedReceiver<PathBuf>, builder: Arc<PackageBuilder>, debounce: Duration) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(package) => {
                    pending.insert(package);
                }
                None => return,
            }
            continue;
        }

        match tokio::time::timeout(debounce, rx.recv()).await {
            Ok(Some(package)) => {
                pending.insert(package);
            }
            Ok(None) => return,
            Err(_) => {
                for package in pending.drain() {
                    debug!("源码变化，预构建 {}", package.display());
                    builder.prebuild(&package, "");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_changed_packages_from_go_files() {
        let event = event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            &["/repo/math/math.go", "/repo/math/math_test.go", "/repo/README.md"],
        );
        assert_eq!(changed_packages(&event), vec![PathBuf::from("/repo/math")]);
    }

    #[test]
    fn test_changed_packages_ignores_hidden_and_access() {
        let hidden = event(EventKind::Create(CreateKind::File), &["/repo/math/.math.go"]);
        assert!(changed_packages(&hidden).is_empty());

        let access = event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/repo/math/math.go"],
        );
        assert!(changed_packages(&access).is_empty());
    }

    #[tokio::test]
    async fn test_watch_root_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(PackageBuilder::new(
            "go",
            Duration::from_secs(5),
            dir.path().join("scratch"),
        ));
        let watcher = SourceWatcher::start(builder, Duration::from_millis(50)).unwrap();

        watcher.watch_root(dir.path()).unwrap();
        watcher.watch_root(dir.path()).unwrap();
        assert_eq!(watcher.roots(), vec![dir.path().to_path_buf()]);

        watcher.unwatch_root(dir.path());
        assert!(watcher.roots().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(PackageBuilder::new(
            "go",
            Duration::from_secs(5),
            dir.path().join("scratch"),
        ));
        let watcher = SourceWatcher::start(builder, Duration::from_millis(50)).unwrap();

        assert!(watcher.watch_root(&dir.path().join("missing")).is_err());
    }
}
