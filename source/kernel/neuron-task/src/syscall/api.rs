// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: kernel::Kernel lifecycle operations
//! INVARIANTS: Decode→Check→Execute; user pointers are probed before any state changes, so a
//!             bad pointer never leaves a half-finished operation behind

extern crate alloc;

use alloc::{string::String, vec::Vec};

use super::{
    ready, Args, Error, SysResult, SyscallTable, SYS_EXEC, SYS_EXEC2, SYS_EXIT, SYS_FORK,
    SYS_GETPID, SYS_KILL, SYS_LIST, SYS_REPORT, SYS_SBRK, SYS_SETMEMORYLIMIT, SYS_SLEEP,
    SYS_THREAD_CREATE, SYS_THREAD_EXIT, SYS_THREAD_JOIN, SYS_WAIT, SYS_YIELD,
};
use crate::{
    config::MAXARG,
    error::ProcError,
    kernel::Kernel,
    task::Role,
    types::{CpuId, Pid},
};

/// Longest path or argument string accepted from user memory.
pub const MAXPATH: usize = 128;

/// Execution context of one syscall.
pub struct Context<'a> {
    pub kernel: &'a Kernel,
    pub pid: Pid,
    pub cpu: CpuId,
}

impl<'a> Context<'a> {
    pub fn new(kernel: &'a Kernel, pid: Pid, cpu: CpuId) -> Self {
        Self { kernel, pid, cpu }
    }

    fn read_str(&self, va: usize) -> SysResult<String> {
        self.kernel.read_user_str(self.pid, va, MAXPATH).map_err(|_| Error::BadAddress)
    }

    fn probe_write(&self, va: usize) -> SysResult<()> {
        self.kernel.write_user_u32(self.pid, va, 0).map_err(|_| Error::BadAddress)
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYS_FORK, sys_fork);
    table.register(SYS_EXIT, sys_exit);
    table.register(SYS_WAIT, sys_wait);
    table.register(SYS_KILL, sys_kill);
    table.register(SYS_EXEC, sys_exec);
    table.register(SYS_GETPID, sys_getpid);
    table.register(SYS_SBRK, sys_sbrk);
    table.register(SYS_SLEEP, sys_sleep);
    table.register(SYS_YIELD, sys_yield);
    table.register(SYS_SETMEMORYLIMIT, sys_set_memory_limit);
    table.register(SYS_EXEC2, sys_exec2);
    table.register(SYS_LIST, sys_list);
    table.register(SYS_THREAD_CREATE, sys_thread_create);
    table.register(SYS_THREAD_EXIT, sys_thread_exit);
    table.register(SYS_THREAD_JOIN, sys_thread_join);
    table.register(SYS_REPORT, sys_report);
    log::trace!(target: "syscall", "installed lifecycle handlers");
}

fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.kernel.fork(ctx.pid)?.as_raw() as usize)
}

fn sys_exit(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ready(ctx.kernel.exit(ctx.pid)?)?;
    Err(Error::TaskExit)
}

fn sys_wait(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ready(ctx.kernel.wait(ctx.pid)?)?;
    Ok(child.as_raw() as usize)
}

fn sys_kill(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.kernel.kill(Pid::from_raw(args.get(0)))?;
    Ok(0)
}

/// Reads a null-terminated array of string pointers.
fn read_argv(ctx: &Context<'_>, uargv: usize) -> SysResult<Vec<String>> {
    let mut argv = Vec::new();
    if uargv == 0 {
        return Ok(argv);
    }
    for i in 0..=MAXARG {
        let slot = uargv.checked_add(i * 4).ok_or(Error::BadAddress)?;
        let ptr = ctx.kernel.read_user_u32(ctx.pid, slot).map_err(|_| Error::BadAddress)?;
        if ptr == 0 {
            return Ok(argv);
        }
        argv.push(ctx.read_str(ptr as usize)?);
    }
    Err(ProcError::Validation("too many arguments").into())
}

fn exec_common(ctx: &mut Context<'_>, args: &Args, stack_pages: Option<usize>) -> SysResult<usize> {
    let path = ctx.read_str(args.ptr(0))?;
    let argv = read_argv(ctx, args.ptr(1))?;
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    ready(ctx.kernel.exec(ctx.pid, &path, &argv, stack_pages)?)?;
    Ok(argv.len())
}

fn sys_exec(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    exec_common(ctx, args, None)
}

fn sys_exec2(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    exec_common(ctx, args, Some(args.get(2) as usize))
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.pid.as_raw() as usize)
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let delta = args.get(0) as i32 as isize;
    Ok(ctx.kernel.grow_memory(ctx.pid, delta)?)
}

fn sys_sleep(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ready(ctx.kernel.sleep_ticks(ctx.pid, u64::from(args.get(0)))?)?;
    Ok(0)
}

fn sys_yield(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Err(Error::Yield)
}

fn sys_set_memory_limit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = Pid::from_raw(args.get(0));
    let limit = i64::from(args.get(1) as i32);
    ctx.kernel.set_memory_limit(target, limit)?;
    Ok(0)
}

fn sys_list(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let rows = ctx.kernel.list_tasks();
    for row in &rows {
        log::info!(target: "list", "{}", row);
    }
    Ok(rows.len())
}

fn sys_thread_create(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let tid_ptr = args.ptr(0);
    ctx.probe_write(tid_ptr)?;
    let tid = ctx.kernel.thread_create(ctx.pid, args.ptr(1), args.get(2))?;
    if ctx.kernel.write_user_u32(ctx.pid, tid_ptr, tid.as_raw()).is_err() {
        log::warn!(target: "syscall", "thread_create: {} lost tid {} store", ctx.pid, tid);
    }
    Ok(0)
}

fn sys_thread_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let role = ctx.kernel.table().get(ctx.pid).map(|t| t.role());
    if role != Some(Role::Subthread) {
        return Err(ProcError::InvalidRole.into());
    }
    ready(ctx.kernel.thread_exit(ctx.pid, args.get(0))?)?;
    Err(Error::TaskExit)
}

fn sys_thread_join(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let tid = Pid::from_raw(args.get(0));
    let retval_ptr = args.ptr(1);
    if retval_ptr != 0 {
        ctx.probe_write(retval_ptr)?;
    }
    let value = ready(ctx.kernel.thread_join(ctx.pid, tid)?)?;
    if retval_ptr != 0 && ctx.kernel.write_user_u32(ctx.pid, retval_ptr, value).is_err() {
        log::warn!(target: "syscall", "thread_join: {} lost exit value of {}", ctx.pid, tid);
    }
    Ok(0)
}

fn sys_report(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.kernel.report(ctx.pid, args.get(0));
    Ok(0)
}
