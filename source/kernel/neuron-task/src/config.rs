// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time configuration of the task subsystem
//! OWNERS: @kernel-sched-team
//! PUBLIC API: KernelConfig, SchedPolicy, FeedbackConfig, SubthreadExit, SubthreadExec, KillScope
//! DEPENDS_ON: error::ProcError
//! INVARIANTS: Validated once in Kernel::new; immutable afterwards

use crate::error::ProcError;

/// Default capacity of the task table.
pub const NPROC: usize = 64;
/// Open file slots per task.
pub const NOFILE: usize = 16;
/// Maximum number of exec arguments.
pub const MAXARG: usize = 32;
/// Bounds for the stack page count accepted by exec-with-stack-size.
pub const MIN_STACK_PAGES: usize = 1;
pub const MAX_STACK_PAGES: usize = 100;
/// Stack pages used by plain exec.
pub const DEFAULT_STACK_PAGES: usize = 1;
/// Longest debug name kept for a task.
pub const MAX_NAME_LEN: usize = 15;
/// Feedback-queue depth.
pub const FEEDBACK_LEVELS: usize = 3;

static_assertions::const_assert!(MIN_STACK_PAGES >= 1);
static_assertions::const_assert!(MIN_STACK_PAGES <= DEFAULT_STACK_PAGES);
static_assertions::const_assert!(DEFAULT_STACK_PAGES <= MAX_STACK_PAGES);

/// Scheduling policy plugged in at the selection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Slot-order round robin; every timer tick yields.
    RoundRobin,
    /// Multi-level feedback queue.
    Feedback(FeedbackConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackConfig {
    /// Ticks a task may run at each level before it is demoted.
    pub quanta: [u32; FEEDBACK_LEVELS],
    /// Every `boost_interval` ticks all tasks return to level 0.
    pub boost_interval: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { quanta: [4, 6, 8], boost_interval: 100 }
    }
}

/// What `exit` does when a SUBTHREAD calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubthreadExit {
    /// Treated as `thread_exit(0)`.
    RedirectToThreadExit,
    /// Fails with `InvalidRole`.
    Reject,
}

/// What `exec` does when a SUBTHREAD calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubthreadExec {
    /// The caller leaves its group, becomes MAIN of a new one and the old group is killed.
    Absorb,
    /// Fails with `InvalidRole`.
    Refuse,
}

/// Which tasks `kill(target)` marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    /// Every task whose group id equals `target`.
    Group,
    /// Only the task whose id equals `target`.
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub capacity: usize,
    /// Kernel stacks available; bounds the number of live tasks independently of `capacity`.
    pub kernel_stacks: usize,
    /// Physical frames backing every user address space.
    pub frames: usize,
    /// Concurrent filesystem transactions admitted before callers sleep.
    pub log_capacity: usize,
    /// User instructions executed between timer ticks.
    pub tick_instructions: u32,
    pub sched: SchedPolicy,
    pub exit_from_subthread: SubthreadExit,
    pub exec_from_subthread: SubthreadExec,
    pub kill_scope: KillScope,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            capacity: NPROC,
            kernel_stacks: NPROC,
            frames: 4096,
            log_capacity: 3,
            tick_instructions: 64,
            sched: SchedPolicy::RoundRobin,
            exit_from_subthread: SubthreadExit::RedirectToThreadExit,
            exec_from_subthread: SubthreadExec::Absorb,
            kill_scope: KillScope::Group,
        }
    }
}

impl KernelConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_kernel_stacks(mut self, stacks: usize) -> Self {
        self.kernel_stacks = stacks;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_log_capacity(mut self, ops: usize) -> Self {
        self.log_capacity = ops;
        self
    }

    pub fn with_tick_instructions(mut self, n: u32) -> Self {
        self.tick_instructions = n;
        self
    }

    pub fn with_sched(mut self, sched: SchedPolicy) -> Self {
        self.sched = sched;
        self
    }

    pub fn with_exit_from_subthread(mut self, policy: SubthreadExit) -> Self {
        self.exit_from_subthread = policy;
        self
    }

    pub fn with_exec_from_subthread(mut self, policy: SubthreadExec) -> Self {
        self.exec_from_subthread = policy;
        self
    }

    pub fn with_kill_scope(mut self, scope: KillScope) -> Self {
        self.kill_scope = scope;
        self
    }

    /// Rejects configurations the kernel cannot boot with.
    pub fn validate(&self) -> Result<(), ProcError> {
        if self.capacity == 0 {
            return Err(ProcError::Validation("task table capacity must be nonzero"));
        }
        if self.kernel_stacks == 0 {
            return Err(ProcError::Validation("kernel stack pool must be nonzero"));
        }
        if self.log_capacity == 0 {
            return Err(ProcError::Validation("log capacity must be nonzero"));
        }
        if self.tick_instructions == 0 {
            return Err(ProcError::Validation("tick interval must be nonzero"));
        }
        if let SchedPolicy::Feedback(cfg) = self.sched {
            if cfg.quanta.iter().any(|q| *q == 0) || cfg.boost_interval == 0 {
                return Err(ProcError::Validation("feedback quanta and boost interval must be nonzero"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_sized_pools_rejected() {
        assert!(KernelConfig::default().with_capacity(0).validate().is_err());
        assert!(KernelConfig::default().with_kernel_stacks(0).validate().is_err());
        assert!(KernelConfig::default().with_log_capacity(0).validate().is_err());
        let bad = FeedbackConfig { quanta: [1, 0, 1], boost_interval: 10 };
        assert!(KernelConfig::default().with_sched(SchedPolicy::Feedback(bad)).validate().is_err());
    }
}
