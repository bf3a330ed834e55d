// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task selection policy (round robin or multi-level feedback)
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (pick/admit/on_tick/advance_clock), SchedInfo
//! DEPENDS_ON: config::{SchedPolicy, FeedbackConfig}, task::Task
//! INVARIANTS: Only RUNNABLE tasks not still bound to a CPU are picked; RR within a level
//!
//! The scheduler owns no tasks. It scans the task table's slots under the table lock and
//! keeps only cursors, the tick clock and per-task accounting in `SchedInfo`.

use crate::config::{FeedbackConfig, SchedPolicy, FEEDBACK_LEVELS};
use crate::task::{Task, TaskState};

/// Per-task scheduler accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedInfo {
    pub level: u8,
    pub ticks_used: u32,
}

pub struct Scheduler {
    policy: SchedPolicy,
    cursors: [usize; FEEDBACK_LEVELS],
    ticks: u64,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy) -> Self {
        Self { policy, cursors: [0; FEEDBACK_LEVELS], ticks: 0 }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    /// Ticks observed since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn eligible(task: &Task) -> bool {
        task.state == TaskState::Runnable && task.cpu.is_none()
    }

    /// Returns the slot index of the next task to run.
    pub fn pick(&mut self, tasks: &[Task]) -> Option<usize> {
        let n = tasks.len();
        if n == 0 {
            return None;
        }
        match self.policy {
            SchedPolicy::RoundRobin => {
                let start = self.cursors[0];
                let slot = (0..n).map(|i| (start + i) % n).find(|&i| Self::eligible(&tasks[i]))?;
                self.cursors[0] = (slot + 1) % n;
                Some(slot)
            }
            SchedPolicy::Feedback(_) => {
                for level in 0..FEEDBACK_LEVELS {
                    let start = self.cursors[level];
                    let found = (0..n).map(|i| (start + i) % n).find(|&i| {
                        Self::eligible(&tasks[i]) && tasks[i].sched.level as usize == level
                    });
                    if let Some(slot) = found {
                        self.cursors[level] = (slot + 1) % n;
                        return Some(slot);
                    }
                }
                None
            }
        }
    }

    /// Resets accounting for a task entering the run queue for the first time.
    pub fn admit(&self, info: &mut SchedInfo) {
        *info = SchedInfo::default();
    }

    pub fn advance_clock(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Charges a timer tick to `running`; returns true when it must yield.
    pub fn on_tick(&mut self, tasks: &mut [Task], running: usize) -> bool {
        let now = self.advance_clock();
        let SchedPolicy::Feedback(FeedbackConfig { quanta, boost_interval }) = self.policy else {
            return true;
        };
        let mut expired = false;
        if let Some(task) = tasks.get_mut(running) {
            let info = &mut task.sched;
            info.ticks_used += 1;
            let level = info.level as usize;
            if info.ticks_used >= quanta[level.min(FEEDBACK_LEVELS - 1)] {
                info.level = (level + 1).min(FEEDBACK_LEVELS - 1) as u8;
                info.ticks_used = 0;
                expired = true;
            }
        }
        if now % boost_interval == 0 {
            for task in tasks.iter_mut().filter(|t| t.state != TaskState::Unused) {
                task.sched = SchedInfo::default();
            }
            log::trace!(target: "sched", "priority boost at tick {}", now);
            expired = true;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskTable;

    fn runnable_table(n: usize, policy: SchedPolicy) -> TaskTable {
        let mut table = TaskTable::new(n, n, policy);
        for _ in 0..n {
            let slot = table.allocate().unwrap();
            table.slot_mut(slot).state = TaskState::Runnable;
        }
        table
    }

    #[test]
    fn round_robin_rotates_through_slots() {
        let table = runnable_table(3, SchedPolicy::RoundRobin);
        let mut sched = Scheduler::new(SchedPolicy::RoundRobin);
        let order: alloc::vec::Vec<_> = (0..4).filter_map(|_| sched.pick(table.slots())).collect();
        assert_eq!(order, [0, 1, 2, 0]);
    }

    #[test]
    fn tasks_bound_to_a_cpu_are_skipped() {
        let mut table = runnable_table(2, SchedPolicy::RoundRobin);
        table.slot_mut(0).cpu = Some(crate::types::CpuId::BOOT);
        let mut sched = Scheduler::new(SchedPolicy::RoundRobin);
        assert_eq!(sched.pick(table.slots()), Some(1));
        assert_eq!(sched.pick(table.slots()), Some(1));
    }

    #[test]
    fn feedback_demotes_after_quantum_and_prefers_higher_levels() {
        let cfg = FeedbackConfig { quanta: [2, 3, 4], boost_interval: 1000 };
        let policy = SchedPolicy::Feedback(cfg);
        let mut table = runnable_table(2, policy);
        let mut sched = Scheduler::new(policy);
        assert!(!sched.on_tick(table.slots_mut(), 0));
        assert!(sched.on_tick(table.slots_mut(), 0));
        assert_eq!(table.slot(0).sched.level, 1);
        assert_eq!(sched.pick(table.slots()), Some(1));
        assert_eq!(sched.pick(table.slots()), Some(1));
        table.slot_mut(1).state = TaskState::Sleeping;
        assert_eq!(sched.pick(table.slots()), Some(0));
    }

    #[test]
    fn feedback_boost_resets_levels() {
        let cfg = FeedbackConfig { quanta: [1, 1, 1], boost_interval: 3 };
        let policy = SchedPolicy::Feedback(cfg);
        let mut table = runnable_table(1, policy);
        let mut sched = Scheduler::new(policy);
        sched.on_tick(table.slots_mut(), 0);
        sched.on_tick(table.slots_mut(), 0);
        assert_eq!(table.slot(0).sched.level, 2);
        assert!(sched.on_tick(table.slots_mut(), 0));
        assert_eq!(table.slot(0).sched, SchedInfo::default());
        assert_eq!(sched.ticks(), 3);
    }

    #[test]
    fn round_robin_yields_every_tick() {
        let mut table = runnable_table(1, SchedPolicy::RoundRobin);
        let mut sched = Scheduler::new(SchedPolicy::RoundRobin);
        assert!(sched.on_tick(table.slots_mut(), 0));
    }
}
