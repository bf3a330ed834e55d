// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYS_* IDs
//! DEPENDS_ON: kernel::Kernel, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; arguments in r1..r3, result in r0

pub mod api;

use core::{fmt, task::Poll};

use crate::{error::ProcError, trap::TrapFrame};

/// Maximum number of syscalls supported by the dispatch table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers r1-r3.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [u32; 3],
}

impl Args {
    pub const fn new(regs: [u32; 3]) -> Self {
        Self { regs }
    }

    pub fn from_frame(frame: &TrapFrame) -> Self {
        Self::new([frame.arg(0), frame.arg(1), frame.arg(2)])
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> u32 {
        self.regs[index]
    }

    /// Register `index` as a user address.
    pub fn ptr(&self, index: usize) -> usize {
        self.regs[index] as usize
    }
}

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
/// Sleeps for r1 timer ticks.
pub const SYS_SLEEP: usize = 13;
pub const SYS_YIELD: usize = 14;
pub const SYS_SETMEMORYLIMIT: usize = 22;
/// Exec with an explicit stack page count in r3.
pub const SYS_EXEC2: usize = 23;
pub const SYS_LIST: usize = 24;
pub const SYS_THREAD_CREATE: usize = 25;
pub const SYS_THREAD_EXIT: usize = 26;
pub const SYS_THREAD_JOIN: usize = 27;
/// Debug sink: records r1 for the host to inspect.
pub const SYS_REPORT: usize = 28;

static_assertions::const_assert!(SYS_REPORT < MAX_SYSCALL);

/// Value returned in r0 for any failed syscall.
pub const ERR_RETURN: u32 = u32::MAX;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Lifecycle operation failed.
    Proc(ProcError),
    /// A user pointer argument is not mapped with user access.
    BadAddress,
    /// The task went to sleep. Retry the same syscall when it runs again.
    Reschedule,
    /// The syscall completed and the caller gives up the CPU.
    Yield,
    /// Current task terminated and should not resume.
    TaskExit,
}

impl From<ProcError> for Error {
    fn from(value: ProcError) -> Self {
        Self::Proc(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Maps a blocking lifecycle result onto the restart protocol.
pub(crate) fn ready<T>(poll: Poll<T>) -> SysResult<T> {
    match poll {
        Poll::Ready(value) => Ok(value),
        Poll::Pending => Err(Error::Reschedule),
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Table with every lifecycle syscall installed.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}
