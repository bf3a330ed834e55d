// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel instance: locks, boot of the root task, CPU-facing scheduling hooks
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/boot/schedule/switch_out/tick/idle_state/...), Report, SpaceStats, IdleState
//! DEPENDS_ON: task::TaskTable, mm::AddressSpaceManager, fs::TxnLog, loader::ImageLoader
//! INVARIANTS: Lock order is log -> table -> address spaces; the table lock is never held
//!             while acquiring the log lock
//!
//! The lifecycle operations (`fork`, `exec`, `exit`, ...) are implemented on `Kernel` in
//! `task::lifecycle`.

extern crate alloc;

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};

use spin::{Mutex, MutexGuard};

use crate::{
    config::{KernelConfig, DEFAULT_STACK_PAGES},
    error::ProcError,
    fs::{Inode, TxnLog},
    loader::ImageLoader,
    mm::{AddressSpaceManager, AsHandle},
    monitor::{self, WaitKey},
    task::{AsBinding, TaskState, TaskTable},
    trap::TrapFrame,
    types::{CpuId, Pid},
};

/// Value a task published through the debug report syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub pid: Pid,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceStats {
    pub live: usize,
    pub destroyed: u64,
    pub frames_in_use: usize,
}

/// What an idle CPU should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    /// Another CPU is running something, or a task is runnable but still switching out.
    Busy,
    /// Only timed sleepers remain; the clock must advance.
    TimerOnly,
    /// Nothing can ever run again without outside help.
    Quiescent,
}

pub struct Kernel {
    config: KernelConfig,
    pub(crate) table: Mutex<TaskTable>,
    pub(crate) spaces: Mutex<AddressSpaceManager>,
    pub(crate) log: TxnLog,
    pub(crate) loader: Box<dyn ImageLoader>,
    root: Arc<Inode>,
    reports: Mutex<Vec<Report>>,
}

static_assertions::assert_impl_all!(Kernel: Send, Sync);

impl Kernel {
    pub fn new(config: KernelConfig, loader: impl ImageLoader + 'static) -> Result<Self, ProcError> {
        config.validate()?;
        Ok(Self {
            table: Mutex::new(TaskTable::new(config.capacity, config.kernel_stacks, config.sched)),
            spaces: Mutex::new(AddressSpaceManager::new(config.frames)),
            log: TxnLog::new(config.log_capacity),
            loader: Box::new(loader),
            root: Inode::new("/"),
            reports: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Locks the task table.
    pub fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock()
    }

    pub fn root_inode(&self) -> &Arc<Inode> {
        &self.root
    }

    /// Creates the root task from `path`. It becomes the reaper of orphans and never exits.
    pub fn boot(&self, path: &str) -> Result<Pid, ProcError> {
        let slot = {
            let mut table = self.table.lock();
            if table.init().is_some() {
                return Err(ProcError::Validation("root task already running"));
            }
            table.allocate()?
        };
        let argv = [path];
        let built = match self.build_image(path, &argv, DEFAULT_STACK_PAGES, 0) {
            Ok(built) => built,
            Err(err) => {
                self.table.lock().release(slot);
                return Err(err);
            }
        };
        let mut table = self.table.lock();
        let pid = table.slot(slot).pid();
        let attached = self.spaces.lock().attach(built.handle, pid);
        if let Err(err) = attached {
            self.discard_image(built.handle);
            table.release(slot);
            return Err(err.into());
        }
        let task = table.slot_mut(slot);
        task.space = Some(AsBinding::Owner(built.handle));
        task.size = built.size;
        task.stack = built.stack;
        task.frame = built.frame;
        task.cwd = Some(self.root.clone());
        task.name = built.name;
        table.admit(slot);
        table.set_init(pid);
        log::info!(target: "task", "boot: root task {} from {}", pid, path);
        Ok(pid)
    }

    /// Binds the next runnable task to `cpu`.
    pub fn schedule(&self, cpu: CpuId) -> Option<Pid> {
        self.table.lock().pick_next(cpu)
    }

    /// Gives up the CPU; RUNNING becomes RUNNABLE.
    pub fn yield_task(&self, pid: Pid) {
        let mut table = self.table.lock();
        if let Some(task) = table.get_mut(pid) {
            if task.state == TaskState::Running {
                task.state = TaskState::Runnable;
            }
        }
    }

    /// Ends a dispatch: the task has already left RUNNING and now leaves the CPU.
    pub fn switch_out(&self, pid: Pid, cpu: CpuId) {
        let mut table = self.table.lock();
        let Some(task) = table.get_mut(pid) else {
            return;
        };
        if task.state == TaskState::Running {
            panic!("kernel invariant: {} switched out of {} while RUNNING", pid, cpu);
        }
        if task.cpu == Some(cpu) {
            task.cpu = None;
        }
    }

    /// Timer tick while `pid` runs. Wakes timed sleepers; returns true when `pid` was
    /// descheduled and must switch out.
    pub fn tick(&self, pid: Pid) -> bool {
        let mut table = self.table.lock();
        let preempt = table.charge_tick(pid);
        monitor::wakeup(&mut table, WaitKey::Ticks);
        if preempt {
            if let Some(task) = table.get_mut(pid) {
                if task.state == TaskState::Running {
                    task.state = TaskState::Runnable;
                    return true;
                }
            }
        }
        false
    }

    /// Timer tick on an idle CPU.
    pub fn idle_tick(&self) -> u64 {
        let mut table = self.table.lock();
        let now = table.advance_clock();
        monitor::wakeup(&mut table, WaitKey::Ticks);
        now
    }

    pub fn ticks(&self) -> u64 {
        self.table.lock().ticks()
    }

    pub fn idle_state(&self) -> IdleState {
        let table = self.table.lock();
        if table.iter().any(|t| t.state == TaskState::Runnable || t.cpu.is_some()) {
            return IdleState::Busy;
        }
        if table.iter().any(|t| t.state == TaskState::Sleeping && t.chan == Some(WaitKey::Ticks)) {
            return IdleState::TimerOnly;
        }
        IdleState::Quiescent
    }

    pub fn is_killed(&self, pid: Pid) -> bool {
        self.table.lock().get(pid).map(|t| t.killed).unwrap_or(false)
    }

    /// Marks a single task killed, e.g. after a user fault.
    pub(crate) fn kill_task(&self, pid: Pid) {
        let mut table = self.table.lock();
        if let Some(task) = table.get_mut(pid) {
            task.killed = true;
        }
    }

    /// Saved frame and address space of `pid`, as restored on return to user mode.
    pub fn user_context(&self, pid: Pid) -> Option<(TrapFrame, AsHandle)> {
        let table = self.table.lock();
        let task = table.get(pid)?;
        Some((task.frame, task.address_space()?))
    }

    pub fn save_frame(&self, pid: Pid, frame: TrapFrame) {
        if let Some(task) = self.table.lock().get_mut(pid) {
            task.frame = frame;
        }
    }

    pub(crate) fn update_frame(&self, pid: Pid, f: impl FnOnce(&mut TrapFrame)) {
        if let Some(task) = self.table.lock().get_mut(pid) {
            f(&mut task.frame);
        }
    }

    fn handle_of(&self, pid: Pid) -> Result<AsHandle, ProcError> {
        self.table.lock().get(pid).and_then(|t| t.address_space()).ok_or(ProcError::NotFound)
    }

    pub fn read_user_u32(&self, pid: Pid, va: usize) -> Result<u32, ProcError> {
        let handle = self.handle_of(pid)?;
        Ok(self.spaces.lock().read_u32(handle, va)?)
    }

    pub fn write_user_u32(&self, pid: Pid, va: usize, value: u32) -> Result<(), ProcError> {
        let handle = self.handle_of(pid)?;
        Ok(self.spaces.lock().write_u32(handle, va, value)?)
    }

    pub fn read_user_str(&self, pid: Pid, va: usize, max: usize) -> Result<String, ProcError> {
        let handle = self.handle_of(pid)?;
        Ok(self.spaces.lock().copy_in_str(handle, va, max)?)
    }

    pub fn report(&self, pid: Pid, value: u32) {
        log::debug!(target: "report", "{} reports {}", pid, value);
        self.reports.lock().push(Report { pid, value });
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub fn space_stats(&self) -> SpaceStats {
        let spaces = self.spaces.lock();
        SpaceStats {
            live: spaces.live(),
            destroyed: spaces.destroyed(),
            frames_in_use: spaces.frames_in_use(),
        }
    }

    pub(crate) fn discard_image(&self, handle: AsHandle) {
        if let Err(err) = self.spaces.lock().destroy(handle) {
            log::error!(target: "task", "discarding unused image failed: {:?}", err);
        }
    }
}
