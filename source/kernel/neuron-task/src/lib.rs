// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON execution-context manager: task table, lifecycle, threads, scheduling
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, ProcError, Cpu, syscall ABI, user-mode toolchain
//! DEPENDS_ON: spin, bitflags, thiserror, log, static_assertions; parking_lot (std runner)
//! INVARIANTS: Lock order log -> table -> address spaces; no unwrap outside tests

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod monitor;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod user;

#[cfg(feature = "std")]
pub mod host;

pub use config::{FeedbackConfig, KernelConfig, KillScope, SchedPolicy, SubthreadExec, SubthreadExit};
pub use cpu::{Cpu, CpuStats, Round};
pub use error::{ProcError, Resource};
pub use kernel::{IdleState, Kernel, Report, SpaceStats};
pub use loader::{ImageLoader, ImageRegistry, LoadError, ProgramImage, Segment};
pub use task::{audit::InvariantViolation, list::TaskInfo, Role, TaskState};
pub use types::{CpuId, Pid};
