//! 外部资源适配：仓库镜像、Go 构建、Worker 创建以及源码监听

pub mod builder;
pub mod provisioner;
pub mod repository;
pub mod watcher;

pub use builder::{classify_build, BuildOutcome, PackageBuilder};
pub use provisioner::{DockerProvisioner, LocalProcessProvisioner};
pub use repository::{mirror_tree, RepositoryGuard, RepositoryRegistry, SyncStats, SyncedRepository};
pub use watcher::{changed_packages, SourceWatcher};
