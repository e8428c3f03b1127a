//! 仓库镜像
//!
//! 每个源码根目录对应一个 [`SyncedRepository`]，Worker 在独占持有期间把源码
//! 同步到自己的镜像目录，再在镜像中构建和运行测试。

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use testfleet_core::{FleetError, FleetResult};

use crate::watcher::SourceWatcher;

/// 同步时忽略的目录
const IGNORED_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// 一次同步的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
struct Slot {
    held: bool,
    holder: Option<String>,
}

/// 源码根目录的独占镜像
#[derive(Debug)]
pub struct SyncedRepository {
    source: PathBuf,
    mirror: PathBuf,
    slot: Mutex<Slot>,
    released: Notify,
}

impl SyncedRepository {
    pub fn new(source: impl Into<PathBuf>, mirror: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            mirror: mirror.into(),
            slot: Mutex::new(Slot::default()),
            released: Notify::new(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn mirror(&self) -> &Path {
        &self.mirror
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前持有者
    pub fn holder(&self) -> Option<String> {
        self.slot().holder.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.slot().held
    }

    /// 等待独占权，返回的守卫被丢弃时释放并唤醒所有等待者
    pub async fn lock(self: &Arc<Self>, holder: impl Into<String>) -> RepositoryGuard {
        let holder = holder.into();
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过检查与等待之间的释放
            notified.as_mut().enable();

            {
                let mut slot = self.slot();
                if !slot.held {
                    slot.held = true;
                    slot.holder = Some(holder.clone());
                    debug!("{} 获得仓库 {} 的独占权", holder, self.source.display());
                    return RepositoryGuard {
                        repository: Arc::clone(self),
                    };
                }
            }

            notified.await;
        }
    }

    /// 不等待，已被占用时返回 `None`
    pub fn try_lock(self: &Arc<Self>, holder: impl Into<String>) -> Option<RepositoryGuard> {
        let mut slot = self.slot();
        if slot.held {
            return None;
        }
        slot.held = true;
        slot.holder = Some(holder.into());
        Some(RepositoryGuard {
            repository: Arc::clone(self),
        })
    }

    fn unlock(&self) {
        {
            let mut slot = self.slot();
            slot.held = false;
            slot.holder = None;
        }
        self.released.notify_waiters();
    }
}

/// 仓库独占守卫，只有持有守卫时才能同步
#[derive(Debug)]
pub struct RepositoryGuard {
    repository: Arc<SyncedRepository>,
}

impl RepositoryGuard {
    pub fn source(&self) -> &Path {
        self.repository.source()
    }

    pub fn mirror(&self) -> &Path {
        self.repository.mirror()
    }

    /// 源码目录中的路径在镜像中的对应位置
    pub fn mirrored_path(&self, source_path: &Path) -> FleetResult<PathBuf> {
        let relative = source_path.strip_prefix(self.source()).map_err(|_| {
            FleetError::RepositorySync(format!(
                "{} 不在仓库 {} 中",
                source_path.display(),
                self.source().display()
            ))
        })?;
        Ok(self.mirror().join(relative))
    }

    /// 把源码目录同步到镜像，镜像中多余的文件会被删除
    pub async fn sync_in_lock(&self) -> FleetResult<SyncStats> {
        let source = self.source().to_path_buf();
        let mirror = self.mirror().to_path_buf();
        let stats = tokio::task::spawn_blocking(move || mirror_tree(&source, &mirror))
            .await
            .map_err(|e| FleetError::Internal(format!("同步任务异常: {e}")))??;
        info!(
            "仓库 {} 已同步: 复制 {}, 未变 {}, 删除 {}",
            self.source().display(),
            stats.copied,
            stats.unchanged,
            stats.deleted
        );
        Ok(stats)
    }
}

impl Drop for RepositoryGuard {
    fn drop(&mut self) {
        self.repository.unlock();
    }
}

fn is_ignored(name: &std::ffi::OsStr) -> bool {
    name.to_str()
        .map(|name| IGNORED_DIRS.contains(&name))
        .unwrap_or(false)
}

fn sync_error(context: &str, path: &Path, e: impl std::fmt::Display) -> FleetError {
    FleetError::RepositorySync(format!("{context} {}: {e}", path.display()))
}

fn needs_copy(source: &fs::Metadata, target: &Path) -> io::Result<bool> {
    let target = match fs::metadata(target) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    if !target.is_file() || target.len() != source.len() {
        return Ok(true);
    }
    Ok(source.modified()? != target.modified()?)
}

/// 复制文件并沿用源文件的修改时间，下次同步据此判断是否变化
fn copy_file(source: &Path, metadata: &fs::Metadata, target: &Path) -> io::Result<()> {
    fs::copy(source, target)?;
    let modified = metadata.modified()?;
    fs::File::options().write(true).open(target)?.set_modified(modified)
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.symlink_metadata()?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// 增量复制并删除镜像中源码已不存在的条目
pub fn mirror_tree(source: &Path, mirror: &Path) -> FleetResult<SyncStats> {
    if !source.is_dir() {
        return Err(FleetError::RepositorySync(format!(
            "源码目录不存在: {}",
            source.display()
        )));
    }
    fs::create_dir_all(mirror).map_err(|e| sync_error("无法创建镜像目录", mirror, e))?;

    let mut stats = SyncStats::default();

    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && is_ignored(entry.file_name())));
    for entry in walker {
        let entry = entry.map_err(|e| sync_error("遍历源码失败", source, e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| sync_error("无效的源码路径", entry.path(), e))?;
        let target = mirror.join(relative);

        if entry.file_type().is_dir() {
            if target.is_file() {
                fs::remove_file(&target).map_err(|e| sync_error("删除失败", &target, e))?;
            }
            fs::create_dir_all(&target).map_err(|e| sync_error("创建目录失败", &target, e))?;
        } else if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| sync_error("读取元数据失败", entry.path(), e))?;
            if target.is_dir() {
                fs::remove_dir_all(&target).map_err(|e| sync_error("删除失败", &target, e))?;
            }
            if needs_copy(&metadata, &target).map_err(|e| sync_error("比较失败", &target, e))? {
                copy_file(entry.path(), &metadata, &target)
                    .map_err(|e| sync_error("复制失败", entry.path(), e))?;
                stats.copied += 1;
            } else {
                stats.unchanged += 1;
            }
        } else {
            debug!("跳过符号链接 {}", entry.path().display());
        }
    }

    let mut stale = Vec::new();
    for entry in WalkDir::new(mirror).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| sync_error("遍历镜像失败", mirror, e))?;
        let relative = entry
            .path()
            .strip_prefix(mirror)
            .map_err(|e| sync_error("无效的镜像路径", entry.path(), e))?;
        if relative.components().any(|c| is_ignored(c.as_os_str())) {
            stale.push(entry.path().to_path_buf());
            continue;
        }
        let keep = match source.join(relative).symlink_metadata() {
            Ok(metadata) if entry.file_type().is_dir() => metadata.is_dir(),
            Ok(metadata) => metadata.is_file(),
            Err(_) => false,
        };
        if !keep {
            stale.push(entry.path().to_path_buf());
        }
    }

    // 父目录先于子条目出现，删除父目录后跳过其子条目
    let mut removed: Vec<PathBuf> = Vec::new();
    for path in stale {
        if removed.iter().any(|parent| path.starts_with(parent)) {
            continue;
        }
        remove_path(&path).map_err(|e| sync_error("删除失败", &path, e))?;
        stats.deleted += 1;
        removed.push(path);
    }

    Ok(stats)
}

/// 每个源码根目录一个 [`SyncedRepository`]
pub struct RepositoryRegistry {
    mirror_root: PathBuf,
    repositories: Mutex<HashMap<PathBuf, Arc<SyncedRepository>>>,
    watcher: Option<Arc<SourceWatcher>>,
}

impl RepositoryRegistry {
    pub fn new(mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            repositories: Mutex::new(HashMap::new()),
            watcher: None,
        }
    }

    /// 新登记的根目录同时交给源码监听器
    pub fn with_watcher(mut self, watcher: Arc<SourceWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    fn repositories(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<SyncedRepository>>> {
        self.repositories.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 镜像目录名由根目录路径转换而来，不同根目录互不冲突
    pub fn mirror_path(&self, root: &Path) -> PathBuf {
        let name: String = root
            .to_string_lossy()
            .trim_start_matches(['/', '\\'])
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let name = if name.is_empty() { "root".to_string() } else { name };
        self.mirror_root.join(name)
    }

    pub fn get(&self, root: &Path) -> Option<Arc<SyncedRepository>> {
        self.repositories().get(root).cloned()
    }

    pub fn len(&self) -> usize {
        self.repositories().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 登记根目录，重复登记直接返回已有实例
    ///
    /// `sync` 为真时在后台做首次同步；同步失败会撤销这次登记。
    pub fn watch(self: &Arc<Self>, root: &Path, sync: bool) -> Arc<SyncedRepository> {
        let repository = {
            let mut repositories = self.repositories();
            if let Some(existing) = repositories.get(root) {
                return Arc::clone(existing);
            }
            let repository = Arc::new(SyncedRepository::new(root, self.mirror_path(root)));
            repositories.insert(root.to_path_buf(), Arc::clone(&repository));
            repository
        };
        info!(
            "登记仓库 {} -> {}",
            root.display(),
            repository.mirror().display()
        );

        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.watch_root(root) {
                warn!("无法监听仓库 {}: {}", root.display(), e);
            }
        }

        if sync {
            let registry = Arc::clone(self);
            let background = Arc::clone(&repository);
            tokio::spawn(async move {
                let guard = background.lock("initial-sync").await;
                if let Err(e) = guard.sync_in_lock().await {
                    error!("仓库 {} 首次同步失败，撤销登记: {}", background.source().display(), e);
                    drop(guard);
                    registry.unregister(background.source());
                }
            });
        }

        repository
    }

    pub fn unregister(&self, root: &Path) -> Option<Arc<SyncedRepository>> {
        let removed = self.repositories().remove(root);
        if removed.is_some() {
            if let Some(watcher) = &self.watcher {
                watcher.unwatch_root(root);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn write(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_mirror_copies_and_deletes() {
        let source = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        write(&source.path().join("go.mod"), "module m\n");
        write(&source.path().join("math/math.go"), "package math\n");
        write(&source.path().join(".git/HEAD"), "ref: refs/heads/main\n");
        write(&mirror.path().join("stale.go"), "package stale\n");
        write(&mirror.path().join("old/pkg/x.go"), "package pkg\n");

        let stats = mirror_tree(source.path(), mirror.path()).unwrap();

        assert_eq!(stats.copied, 2);
        assert_eq!(stats.deleted, 2);
        assert!(mirror.path().join("math/math.go").is_file());
        assert!(!mirror.path().join("stale.go").exists());
        assert!(!mirror.path().join("old").exists());
        assert!(!mirror.path().join(".git").exists());
    }

    #[test]
    fn test_mirror_is_incremental() {
        let source = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        write(&source.path().join("a.go"), "package a\n");
        write(&source.path().join("b.go"), "package a\n");
        mirror_tree(source.path(), mirror.path()).unwrap();

        write(&source.path().join("b.go"), "package a\n\nfunc B() {}\n");
        fs::remove_file(source.path().join("a.go")).unwrap();
        let stats = mirror_tree(source.path(), mirror.path()).unwrap();

        assert_eq!(stats, SyncStats { copied: 1, unchanged: 0, deleted: 1 });
        assert_eq!(
            fs::read_to_string(mirror.path().join("b.go")).unwrap(),
            "package a\n\nfunc B() {}\n"
        );
    }

    #[test]
    fn test_mirror_picks_up_same_length_edit_with_older_mtime() {
        let source = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let file = source.path().join("a.go");
        write(&file, "package a // v1");
        mirror_tree(source.path(), mirror.path()).unwrap();

        // 例如 git checkout 取回一个更早的版本
        write(&file, "package a // v2");
        let earlier = std::time::SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(earlier)
            .unwrap();
        let stats = mirror_tree(source.path(), mirror.path()).unwrap();

        assert_eq!(stats.copied, 1);
        assert_eq!(
            fs::read_to_string(mirror.path().join("a.go")).unwrap(),
            "package a // v2"
        );
        let mirrored = fs::metadata(mirror.path().join("a.go")).unwrap().modified().unwrap();
        assert_eq!(mirrored, fs::metadata(&file).unwrap().modified().unwrap());

        let stats = mirror_tree(source.path(), mirror.path()).unwrap();
        assert_eq!(stats, SyncStats { copied: 0, unchanged: 1, deleted: 0 });
    }

    #[test]
    fn test_mirror_replaces_type_changes() {
        let source = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        write(&source.path().join("pkg"), "now a file\n");
        write(&mirror.path().join("pkg/inner.go"), "package pkg\n");

        mirror_tree(source.path(), mirror.path()).unwrap();

        assert!(mirror.path().join("pkg").is_file());
    }

    #[test]
    fn test_missing_source_fails() {
        let mirror = tempfile::tempdir().unwrap();
        let err = mirror_tree(Path::new("/nonexistent/testfleet/src"), mirror.path()).unwrap_err();
        assert!(matches!(err, FleetError::RepositorySync(_)));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let repository = Arc::new(SyncedRepository::new("/repo", "/mirror"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let repository = Arc::clone(&repository);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _guard = repository.lock(format!("worker-{i}")).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!repository.is_locked());
    }

    #[tokio::test]
    async fn test_guard_drop_releases_and_wakes_waiter() {
        let repository = Arc::new(SyncedRepository::new("/repo", "/mirror"));
        let guard = repository.lock("first").await;
        assert_eq!(repository.holder().as_deref(), Some("first"));
        assert!(repository.try_lock("second").is_none());

        let waiter = {
            let repository = Arc::clone(&repository);
            tokio::spawn(async move {
                let _guard = repository.lock("second").await;
                repository.holder()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let holder = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_guard_maps_paths_into_mirror() {
        let repository = Arc::new(SyncedRepository::new("/repo", "/mirror/repo"));
        let guard = repository.lock("worker").await;

        assert_eq!(
            guard.mirrored_path(Path::new("/repo/math")).unwrap(),
            PathBuf::from("/mirror/repo/math")
        );
        assert!(guard.mirrored_path(Path::new("/elsewhere")).is_err());
    }

    #[tokio::test]
    async fn test_watch_is_idempotent() {
        let mirrors = tempfile::tempdir().unwrap();
        let registry = Arc::new(RepositoryRegistry::new(mirrors.path()));
        let root = Path::new("/src/project");

        let first = registry.watch(root, false);
        let second = registry.watch(root, false);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.mirror(), mirrors.path().join("src_project"));
    }

    #[tokio::test]
    async fn test_watch_with_sync_mirrors_in_background() {
        let source = tempfile::tempdir().unwrap();
        let mirrors = tempfile::tempdir().unwrap();
        write(&source.path().join("math/math.go"), "package math\n");
        let registry = Arc::new(RepositoryRegistry::new(mirrors.path()));

        let repository = registry.watch(source.path(), true);

        let mirrored = repository.mirror().join("math/math.go");
        for _ in 0..200 {
            if mirrored.is_file() && !repository.is_locked() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mirrored.is_file());
    }

    #[tokio::test]
    async fn test_failed_initial_sync_aborts_registration() {
        let mirrors = tempfile::tempdir().unwrap();
        let registry = Arc::new(RepositoryRegistry::new(mirrors.path()));
        let root = Path::new("/nonexistent/testfleet/project");

        registry.watch(root, true);

        for _ in 0..200 {
            if registry.get(root).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.get(root).is_none());
    }
}
