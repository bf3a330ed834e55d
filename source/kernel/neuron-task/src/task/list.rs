// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Read-only task listing for debugging output
//! OWNERS: @kernel-sched-team
//! PUBLIC API: TaskInfo, Kernel::list_tasks, Kernel::try_list_tasks
//! DEPENDS_ON: task::TaskTable
//! INVARIANTS: Listing never mutates the table; UNUSED slots are never reported

extern crate alloc;

use alloc::{string::String, vec::Vec};
use core::fmt;

use super::{Role, Task, TaskState, TaskTable};
use crate::{kernel::Kernel, types::Pid};

/// One row of the task listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub pid: Pid,
    pub state: TaskState,
    pub stack_pages: usize,
    pub size: usize,
    pub limit: usize,
    pub role: Role,
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            pid: task.pid,
            state: task.state,
            stack_pages: task.stack.pages,
            size: task.size,
            limit: task.limit,
            role: task.role,
        }
    }
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.name,
            self.pid.as_raw(),
            self.state.label(),
            self.stack_pages,
            self.size,
            self.limit,
            self.role.label()
        )
    }
}

fn snapshot(table: &TaskTable) -> Vec<TaskInfo> {
    table.iter().map(TaskInfo::from).collect()
}

impl Kernel {
    /// Consistent snapshot of every occupied slot, in slot order.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        snapshot(&self.table.lock())
    }

    /// Best-effort listing that gives up instead of spinning when the table is busy.
    pub fn try_list_tasks(&self) -> Option<Vec<TaskInfo>> {
        self.table.try_lock().map(|table| snapshot(&table))
    }
}
