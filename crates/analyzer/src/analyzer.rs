use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use testfleet_core::{Change, FleetError, FleetResult};
use tracing::{debug, info, warn};

use crate::decl::{is_lifecycle_method, Declaration, TestRole};
use crate::source::Package;

/// 一组变更影响到的测试
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Impact {
    /// 测试函数名 -> 被触达时的深度
    pub tests: BTreeMap<String, usize>,
}

impl Impact {
    /// 受影响测试中的最小深度，没有受影响测试时为 0
    pub fn depth(&self) -> usize {
        self.tests.values().copied().min().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tests.contains_key(name)
    }

    fn record(&mut self, name: &str, depth: usize) {
        let entry = self.tests.entry(name.to_string()).or_insert(depth);
        if depth < *entry {
            *entry = depth;
        }
    }
}

/// 变更影响分析器
///
/// 深度 0 表示测试本身被修改，或直接引用了被修改的声明。
/// 每经过一层非测试代码深度加一，超过 `max_depth` 的链路被丢弃。
#[derive(Debug, Clone)]
pub struct ImpactAnalyzer {
    max_depth: usize,
}

impl ImpactAnalyzer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// 加载 `directory` 下的包并分析 `changes`
    pub fn analyze_directory(&self, directory: &Path, changes: &[Change]) -> FleetResult<(Package, Impact)> {
        let package = Package::load(directory)?;
        let impact = self.analyze(&package, changes);
        Ok((package, impact))
    }

    /// 无效的变更只记录警告并跳过，其余变更照常分析
    pub fn analyze(&self, package: &Package, changes: &[Change]) -> Impact {
        let mut seeds: Vec<&Declaration> = Vec::new();

        for change in changes {
            match self.declarations_in_change(package, change) {
                Ok(decls) => {
                    for decl in decls {
                        if !seeds.iter().any(|s| s.key() == decl.key()) {
                            seeds.push(decl);
                        }
                    }
                }
                Err(e) => warn!("跳过变更 {}: {}", change.path.display(), e),
            }
        }

        let impact = self.propagate(package, seeds);
        info!(
            "包 {} 影响分析完成: {} 个测试, 深度 {}",
            package.directory.display(),
            impact.tests.len(),
            impact.depth()
        );
        impact
    }

    /// 与变更范围有重叠的顶层声明
    pub fn declarations_in_change<'p>(
        &self,
        package: &'p Package,
        change: &Change,
    ) -> FleetResult<Vec<&'p Declaration>> {
        if !change.is_valid() {
            return Err(FleetError::InvalidLocation {
                path: change.path.display().to_string(),
                offset: change.begin,
            });
        }

        let file = package.file_index(&change.path).ok_or_else(|| {
            FleetError::InvalidRequest(format!(
                "{} 不属于包 {}",
                change.path.display(),
                package.directory.display()
            ))
        })?;

        let len = package.files[file].text.len();
        if change.end >= len {
            return Err(FleetError::InvalidLocation {
                path: change.path.display().to_string(),
                offset: change.end,
            });
        }

        Ok(package
            .declarations(file)
            .iter()
            .filter(|d| d.overlaps(change.begin, change.end))
            .collect())
    }

    fn propagate<'p>(&self, package: &'p Package, seeds: Vec<&'p Declaration>) -> Impact {
        let mut impact = Impact::default();
        let mut visited: HashSet<(usize, usize)> = HashSet::new();
        let mut queue: VecDeque<(&'p Declaration, usize)> =
            seeds.into_iter().map(|decl| (decl, 0)).collect();

        // 广度优先，首次访问即为最小深度
        while let Some((decl, depth)) = queue.pop_front() {
            if !visited.insert(decl.key()) {
                continue;
            }

            if self.record_if_test(package, decl, depth, &mut impact) {
                continue;
            }

            for referrer in package.referrers(decl) {
                if self.record_if_test(package, referrer, depth, &mut impact) {
                    continue;
                }
                if depth + 1 > self.max_depth {
                    debug!(
                        "丢弃引用链 {} -> {}: 深度 {} 超过上限 {}",
                        decl.name,
                        referrer.name,
                        depth + 1,
                        self.max_depth
                    );
                    continue;
                }
                queue.push_back((referrer, depth + 1));
            }
        }

        impact
    }

    fn record_if_test(&self, package: &Package, decl: &Declaration, depth: usize, impact: &mut Impact) -> bool {
        match package.role(decl) {
            TestRole::TestFunction => {
                impact.record(&decl.name, depth);
                true
            }
            TestRole::SuiteMethod { suite } => {
                if is_lifecycle_method(&decl.name) {
                    debug!("{} 是测试套件 {} 的生命周期方法", decl.name, suite);
                }
                let runners = package.suite_runners(suite);
                if runners.is_empty() {
                    debug!("测试套件 {} 没有启动函数", suite);
                }
                for runner in runners {
                    impact.record(&runner.name, depth);
                }
                true
            }
            TestRole::None => false,
        }
    }

    /// 包内全部可运行的测试
    pub fn list_tests(&self, package: &Package) -> Vec<String> {
        package.test_functions()
    }
}
