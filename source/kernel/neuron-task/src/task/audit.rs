// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Consistency audit of the task table against the address-space manager
//! OWNERS: @kernel-sched-team
//! PUBLIC API: InvariantViolation, Kernel::check_invariants
//! DEPENDS_ON: task::TaskTable, mm::AddressSpaceManager
//! INVARIANTS: Read-only; takes table then address-space lock; every stack lies below its group size
//!
//! EMBRYO slots are skipped: they are being built under the table lock by the same thread
//! that would otherwise observe them half-filled.

extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};

use super::{AsBinding, Role, Task};
use crate::{kernel::Kernel, mm::AsHandle, types::Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("group {group} has {mains} MAIN tasks")]
    MainCount { group: Pid, mains: usize },
    #[error("group {group}: {pid} disagrees on size or limit")]
    GroupDivergence { group: Pid, pid: Pid },
    #[error("address space {handle:?}: {tasks} tasks reference it, {attached} attached")]
    Attachment { handle: AsHandle, tasks: usize, attached: usize },
    #[error("stack of {a} overlaps stack of {b}")]
    StackOverlap { a: Pid, b: Pid },
    #[error("stack of {pid} ends at {end:#x}, above group size {size:#x}")]
    StackOutsideHeap { pid: Pid, end: usize, size: usize },
}

impl Kernel {
    /// Verifies group and address-space bookkeeping. Returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let table = self.table.lock();
        let members: Vec<&Task> = table.iter().filter(|t| t.is_member()).collect();

        let mut groups: BTreeMap<Pid, Vec<&Task>> = BTreeMap::new();
        for task in &members {
            groups.entry(task.group).or_default().push(task);
        }
        for (&group, tasks) in &groups {
            let mains = tasks.iter().filter(|t| t.role == Role::Main).count();
            if mains > 1 || tasks.iter().any(|t| t.role == Role::Main && t.pid != group) {
                return Err(InvariantViolation::MainCount { group, mains });
            }
            let first = tasks[0];
            if let Some(odd) = tasks.iter().find(|t| t.size != first.size || t.limit != first.limit) {
                return Err(InvariantViolation::GroupDivergence { group, pid: odd.pid });
            }
            if let Some(out) = tasks.iter().find(|t| !t.stack.is_empty() && t.stack.end > t.size) {
                return Err(InvariantViolation::StackOutsideHeap {
                    pid: out.pid,
                    end: out.stack.end,
                    size: out.size,
                });
            }
            let main_stack = tasks.iter().find(|t| t.role == Role::Main).map(|t| (t.pid, t.stack));
            let threads: Vec<&&Task> = tasks.iter().filter(|t| t.role == Role::Subthread).collect();
            for (i, a) in threads.iter().enumerate() {
                if let Some((main, stack)) = main_stack {
                    if !stack.is_empty() && a.stack.overlaps(&stack) {
                        return Err(InvariantViolation::StackOverlap { a: a.pid, b: main });
                    }
                }
                if let Some(b) = threads[i + 1..].iter().find(|b| a.stack.overlaps(&b.stack)) {
                    return Err(InvariantViolation::StackOverlap { a: a.pid, b: b.pid });
                }
            }
        }

        let mut refs: BTreeMap<AsHandle, (usize, bool)> = BTreeMap::new();
        for task in &members {
            if let Some(binding) = task.space {
                let entry = refs.entry(binding.handle()).or_insert((0, false));
                entry.0 += 1;
                entry.1 |= matches!(binding, AsBinding::Owner(_));
            }
        }
        let spaces = self.spaces.lock();
        for (&handle, &(tasks, owned)) in &refs {
            let attached = spaces.refcount(handle).unwrap_or(0);
            if attached != tasks || !owned {
                return Err(InvariantViolation::Attachment { handle, tasks, attached });
            }
        }
        Ok(())
    }
}
