use std::collections::VecDeque;
use std::sync::Mutex;

use testfleet_core::{FleetError, FleetResult, JobId};
use tracing::debug;

/// 默认优先级层数
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// 调度队列中的一个条目，指向某个作业的某个批次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledTaskSet {
    pub job_id: JobId,
    pub task_set_id: u64,
}

impl ScheduledTaskSet {
    pub fn new(job_id: JobId, task_set_id: u64) -> Self {
        Self {
            job_id,
            task_set_id,
        }
    }
}

/// 按深度分层的多队列
///
/// 深度越小优先级越高，同一层内先进先出。`next` 从不阻塞。
#[derive(Debug)]
pub struct Scheduler {
    tiers: Mutex<Vec<VecDeque<ScheduledTaskSet>>>,
    max_depth: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Scheduler {
    pub fn new(max_depth: usize) -> Self {
        Self {
            tiers: Mutex::new(vec![VecDeque::new(); max_depth]),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn add(&self, item: ScheduledTaskSet, depth: usize) -> FleetResult<()> {
        if depth >= self.max_depth {
            return Err(FleetError::DepthOutOfRange {
                depth,
                max: self.max_depth,
            });
        }

        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers[depth].push_back(item);
        debug!(
            "批次 {}/{} 进入第 {} 层队列",
            item.job_id, item.task_set_id, depth
        );
        Ok(())
    }

    /// 取出最低非空层的队首；全部为空时返回 [`FleetError::NoRunnableWork`]
    pub fn next(&self) -> FleetResult<ScheduledTaskSet> {
        let mut tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers
            .iter_mut()
            .find_map(VecDeque::pop_front)
            .ok_or(FleetError::NoRunnableWork)
    }

    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 每层排队的批次数
    pub fn depths(&self) -> Vec<usize> {
        let tiers = self.tiers.lock().unwrap_or_else(|e| e.into_inner());
        tiers.iter().map(VecDeque::len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_empty_scheduler_has_no_work() {
        let scheduler = Scheduler::default();
        assert!(matches!(scheduler.next(), Err(FleetError::NoRunnableWork)));
        assert_eq!(scheduler.max_depth(), 10);
    }

    #[test]
    fn test_depth_out_of_range() {
        let scheduler = Scheduler::new(3);
        let err = scheduler.add(ScheduledTaskSet::new(1, 0), 3).unwrap_err();
        assert!(matches!(err, FleetError::DepthOutOfRange { depth: 3, max: 3 }));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_lowest_tier_first_then_fifo() {
        let scheduler = Scheduler::new(4);
        scheduler.add(ScheduledTaskSet::new(1, 0), 3).unwrap();
        scheduler.add(ScheduledTaskSet::new(2, 0), 1).unwrap();
        scheduler.add(ScheduledTaskSet::new(2, 1), 1).unwrap();
        scheduler.add(ScheduledTaskSet::new(3, 0), 0).unwrap();

        assert_eq!(scheduler.depths(), vec![1, 2, 0, 1]);
        assert_eq!(scheduler.next().unwrap(), ScheduledTaskSet::new(3, 0));
        assert_eq!(scheduler.next().unwrap(), ScheduledTaskSet::new(2, 0));
        assert_eq!(scheduler.next().unwrap(), ScheduledTaskSet::new(2, 1));
        assert_eq!(scheduler.next().unwrap(), ScheduledTaskSet::new(1, 0));
        assert!(matches!(scheduler.next(), Err(FleetError::NoRunnableWork)));
    }

    #[test]
    fn test_concurrent_consumers_see_each_item_once() {
        let scheduler = Arc::new(Scheduler::new(5));
        for i in 0..200u64 {
            scheduler
                .add(ScheduledTaskSet::new(i, 0), (i % 5) as usize)
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Ok(item) = scheduler.next() {
                        taken.push(item.job_id);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
