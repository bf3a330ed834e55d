// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sleep/wakeup layered on the task-table lock
//! OWNERS: @kernel-sched-team
//! PUBLIC API: WaitKey, sleep_locked, sleep_releasing, wakeup
//! DEPENDS_ON: task::TaskTable
//! INVARIANTS: Callers hold the table lock (`&mut TaskTable`) from the condition check until
//!             SLEEPING is committed, so a wakeup issued under the same lock is never lost.
//!
//! Blocking operations are restartable: after `sleep_*` the operation returns
//! `Poll::Pending` and is re-executed from the top once the task runs again.

use crate::task::{TaskState, TaskTable};
use crate::types::Pid;

/// Channel a sleeping task waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// Child exit, thread exit, group teardown progress for task `pid`.
    Task(Pid),
    /// Room in the filesystem transaction log.
    LogSpace,
    /// Next timer tick.
    Ticks,
}

/// Puts `pid` to sleep on `key`; the table lock itself is the monitor lock.
pub fn sleep_locked(table: &mut TaskTable, pid: Pid, key: WaitKey) {
    let Some(task) = table.get_mut(pid) else {
        log::error!(target: "sched", "sleep on {:?} by unknown task {}", key, pid);
        return;
    };
    match task.state {
        TaskState::Running | TaskState::Runnable => {}
        other => panic!("kernel invariant: task {} sleeping from state {:?}", pid, other),
    }
    task.state = TaskState::Sleeping;
    task.chan = Some(key);
}

/// Puts `pid` to sleep on `key`, releasing a foreign lock only once the table lock is held.
pub fn sleep_releasing<G>(table: &mut TaskTable, pid: Pid, key: WaitKey, guard: G) {
    drop(guard);
    sleep_locked(table, pid, key);
}

/// Makes every task sleeping on `key` runnable. Returns how many were woken.
pub fn wakeup(table: &mut TaskTable, key: WaitKey) -> usize {
    let mut woken = 0;
    for task in table.slots_mut() {
        if task.state == TaskState::Sleeping && task.chan == Some(key) {
            task.state = TaskState::Runnable;
            task.chan = None;
            woken += 1;
        }
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedPolicy;

    fn table_with_running() -> (TaskTable, Pid) {
        let mut table = TaskTable::new(4, 4, SchedPolicy::RoundRobin);
        let slot = table.allocate().unwrap();
        table.slot_mut(slot).state = TaskState::Running;
        let pid = table.slot(slot).pid();
        (table, pid)
    }

    #[test]
    fn wakeup_after_sleep_makes_runnable() {
        let (mut table, pid) = table_with_running();
        sleep_locked(&mut table, pid, WaitKey::Task(pid));
        assert_eq!(table.get(pid).unwrap().state(), TaskState::Sleeping);
        assert_eq!(wakeup(&mut table, WaitKey::LogSpace), 0);
        assert_eq!(wakeup(&mut table, WaitKey::Task(pid)), 1);
        assert_eq!(table.get(pid).unwrap().state(), TaskState::Runnable);
        assert_eq!(table.get(pid).unwrap().chan, None);
    }

    #[test]
    fn foreign_guard_released_on_sleep() {
        let (mut table, pid) = table_with_running();
        let lock = spin::Mutex::new(());
        let guard = lock.lock();
        sleep_releasing(&mut table, pid, WaitKey::LogSpace, guard);
        assert!(lock.try_lock().is_some());
        assert_eq!(table.get(pid).unwrap().state(), TaskState::Sleeping);
    }

    #[test]
    #[should_panic(expected = "kernel invariant")]
    fn zombie_cannot_sleep() {
        let (mut table, pid) = table_with_running();
        table.get_mut(pid).unwrap().state = TaskState::Zombie;
        sleep_locked(&mut table, pid, WaitKey::Ticks);
    }
}
