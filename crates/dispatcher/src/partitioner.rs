use std::cmp::Reverse;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use testfleet_core::{FleetError, FleetResult, Task, TaskSet};
use tracing::debug;

use crate::profiler::Profiler;

/// 一个装箱结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bin {
    pub tasks: Vec<String>,
    pub load: Duration,
}

/// 最长处理时间优先 (LPT) 装箱
///
/// 按耗时降序排列，耗时相同按名称排序；每个条目放入当前负载最小的箱子，
/// 负载相同取下标最小的箱子。
pub fn pack(mut items: Vec<(String, Duration)>, bins: usize) -> Vec<Bin> {
    let mut result = vec![Bin::default(); bins];
    if bins == 0 {
        return result;
    }

    items.sort_by(|(a_name, a_dur), (b_name, b_dur)| {
        Reverse(*a_dur)
            .cmp(&Reverse(*b_dur))
            .then_with(|| a_name.cmp(b_name))
    });

    for (name, duration) in items {
        let target = result
            .iter()
            .enumerate()
            .min_by_key(|(index, bin)| (bin.load, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        let bin = &mut result[target];
        bin.tasks.push(name);
        bin.load += duration;
    }

    result
}

/// 将作业的测试切分为任务批次
pub struct Partitioner {
    profiler: Arc<Profiler>,
}

impl Partitioner {
    pub fn new(profiler: Arc<Profiler>) -> Self {
        Self { profiler }
    }

    /// 受影响与未受影响的测试分别切分，每个非空分组恰好产生 `batches` 个批次
    /// (可能有空批次)，受影响批次在前，批次 ID 从 0 连续编号。
    pub fn partition(&self, location: &Path, tasks: &[Task], batches: i64) -> FleetResult<Vec<TaskSet>> {
        if batches <= 0 {
            return Err(FleetError::InvalidArgument(format!(
                "批次数必须大于0: {batches}"
            )));
        }
        let bins = usize::try_from(batches)
            .map_err(|_| FleetError::InvalidArgument(format!("批次数过大: {batches}")))?;

        let mut task_sets = Vec::new();
        for affected in [true, false] {
            let group: Vec<(String, Duration)> = tasks
                .iter()
                .filter(|task| task.affected == affected)
                .map(|task| (task.name.clone(), self.profiler.lookup(location, &task.name)))
                .collect();
            if group.is_empty() {
                continue;
            }

            for bin in pack(group, bins) {
                let id = task_sets.len() as u64;
                debug!(
                    "批次 {} (受影响: {}): {} 个测试, 预计耗时 {:?}",
                    id,
                    affected,
                    bin.tasks.len(),
                    bin.load
                );
                task_sets.push(TaskSet::new(id, affected, bin.tasks));
            }
        }

        Ok(task_sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitioner_with(entries: &[(&str, u64)]) -> Partitioner {
        let profiler = Arc::new(Profiler::new());
        for (name, millis) in entries {
            profiler.add(Path::new("/repo/pkg"), name, Duration::from_millis(*millis));
        }
        Partitioner::new(profiler)
    }

    #[test]
    fn test_rejects_non_positive_batch_count() {
        let partitioner = partitioner_with(&[]);
        let tasks = vec![Task::new("TestA", true)];

        for batches in [0, -3] {
            let err = partitioner
                .partition(Path::new("/repo/pkg"), &tasks, batches)
                .unwrap_err();
            assert!(matches!(err, FleetError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_two_unaffected_tasks_two_sets() {
        let partitioner = partitioner_with(&[]);
        let tasks = vec![Task::new("TestA", false), Task::new("TestB", false)];

        let sets = partitioner.partition(Path::new("/repo/pkg"), &tasks, 2).unwrap();

        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| !s.affected && s.tasks.len() == 1));
    }

    #[test]
    fn test_one_affected_task_yields_four_sets() {
        let partitioner = partitioner_with(&[]);
        let tasks = vec![Task::new("TestA", true), Task::new("TestB", false)];

        let sets = partitioner.partition(Path::new("/repo/pkg"), &tasks, 2).unwrap();

        assert_eq!(sets.len(), 4);
        assert!(sets[0].affected && sets[1].affected);
        assert!(!sets[2].affected && !sets[3].affected);
        assert_eq!(sets[0].tasks, vec!["TestA"]);
        assert!(sets[1].is_empty());
        assert_eq!(sets[2].tasks, vec!["TestB"]);
        let ids: Vec<u64> = sets.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_job_yields_no_sets() {
        let partitioner = partitioner_with(&[]);
        let sets = partitioner.partition(Path::new("/repo/pkg"), &[], 4).unwrap();
        assert!(sets.is_empty());
    }

    #[test]
    fn test_sets_cover_tasks_without_overlap() {
        let partitioner = partitioner_with(&[("TestA", 30), ("TestC", 10)]);
        let tasks: Vec<Task> = ["TestA", "TestB", "TestC", "TestD", "TestE"]
            .iter()
            .enumerate()
            .map(|(i, name)| Task::new(*name, i % 2 == 0))
            .collect();

        let sets = partitioner.partition(Path::new("/repo/pkg"), &tasks, 3).unwrap();

        let mut covered: Vec<&str> = sets
            .iter()
            .flat_map(|s| s.tasks.iter().map(String::as_str))
            .collect();
        covered.sort();
        assert_eq!(covered, vec!["TestA", "TestB", "TestC", "TestD", "TestE"]);
    }

    #[test]
    fn test_unknown_durations_sort_last_by_name() {
        let bins = pack(
            vec![
                ("TestZ".to_string(), Duration::ZERO),
                ("TestY".to_string(), Duration::ZERO),
                ("TestSlow".to_string(), Duration::from_secs(5)),
            ],
            1,
        );
        assert_eq!(bins[0].tasks, vec!["TestSlow", "TestY", "TestZ"]);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let bins = pack(
            vec![
                ("TestA".to_string(), Duration::from_millis(10)),
                ("TestB".to_string(), Duration::from_millis(10)),
                ("TestC".to_string(), Duration::from_millis(10)),
            ],
            2,
        );
        assert_eq!(bins[0].tasks, vec!["TestA", "TestC"]);
        assert_eq!(bins[1].tasks, vec!["TestB"]);
    }

    #[test]
    fn test_lpt_load_spread_bounded_by_largest_task() {
        // 确定性的伪随机耗时
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for bins in 1..=6 {
            let items: Vec<(String, Duration)> = (0..40)
                .map(|i| {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    (format!("Test{i:02}"), Duration::from_millis(seed % 1_000))
                })
                .collect();
            let largest = items.iter().map(|(_, d)| *d).max().unwrap();

            let packed = pack(items, bins);

            let max = packed.iter().map(|b| b.load).max().unwrap();
            let min = packed.iter().map(|b| b.load).min().unwrap();
            assert!(
                max - min <= largest,
                "bins={bins}: spread {:?} exceeds largest {:?}",
                max - min,
                largest
            );
        }
    }
}
