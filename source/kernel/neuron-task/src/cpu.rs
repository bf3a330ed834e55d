// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU dispatch loop: pick a task, interpret its user code, handle traps
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Cpu (new/run_once/run), Round, CpuStats
//! DEPENDS_ON: kernel::Kernel, syscall::SyscallTable, user::isa
//! INVARIANTS: A dispatch always ends with `switch_out`, after the task left RUNNING;
//!             kill flags are honoured at every return-to-user point
//!
//! Blocking syscalls return `Error::Reschedule`; the saved pc is rewound over the `sys`
//! instruction so the same syscall is re-executed once the task is woken.

use crate::{
    kernel::{IdleState, Kernel},
    mm::AsHandle,
    syscall::{api::Context, Args, Error, SyscallTable, ERR_RETURN},
    trap::TrapFrame,
    types::{CpuId, Pid},
    user::isa::{self, Fault, SpaceView, Step, INSN_SIZE},
};

/// What one scheduling round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Dispatched(Pid),
    Idle,
    /// Nothing is runnable and nothing will become runnable.
    Quiescent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub dispatches: u64,
    pub idle_rounds: u64,
    pub syscalls: u64,
    pub preemptions: u64,
    pub faults: u64,
}

/// Why the interpreter stopped.
enum Trap {
    Tick(TrapFrame),
    Syscall(TrapFrame, u32),
    Fault(Fault),
}

pub struct Cpu<'k> {
    id: CpuId,
    kernel: &'k Kernel,
    syscalls: SyscallTable,
    stats: CpuStats,
}

impl<'k> Cpu<'k> {
    pub fn new(id: CpuId, kernel: &'k Kernel) -> Self {
        Self { id, kernel, syscalls: SyscallTable::with_defaults(), stats: CpuStats::default() }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn stats(&self) -> CpuStats {
        self.stats
    }

    /// One scheduler iteration.
    pub fn run_once(&mut self) -> Round {
        if let Some(pid) = self.kernel.schedule(self.id) {
            self.dispatch(pid);
            self.stats.dispatches += 1;
            return Round::Dispatched(pid);
        }
        self.stats.idle_rounds += 1;
        match self.kernel.idle_state() {
            IdleState::Busy => Round::Idle,
            IdleState::TimerOnly => {
                self.kernel.idle_tick();
                Round::Idle
            }
            IdleState::Quiescent => Round::Quiescent,
        }
    }

    /// Runs until the system is quiescent or `max_dispatches` tasks were dispatched.
    pub fn run(&mut self, max_dispatches: u64) -> CpuStats {
        while self.stats.dispatches < max_dispatches {
            if self.run_once() == Round::Quiescent {
                break;
            }
        }
        self.stats
    }

    /// Interprets user code of `pid` until the next timer tick, syscall or fault.
    fn execute(&self, pid: Pid, mut frame: TrapFrame, handle: AsHandle) -> Trap {
        let budget = self.kernel.config().tick_instructions;
        for _ in 0..budget {
            let step = {
                let mut spaces = self.kernel.spaces.lock();
                let mut view = SpaceView { spaces: &mut *spaces, handle };
                isa::step(&mut frame, &mut view)
            };
            match step {
                Step::Continue => {}
                Step::Syscall(number) => return Trap::Syscall(frame, number),
                Step::Fault(fault) => {
                    log::trace!(target: "cpu", "{} trapped at pc={:#x}", pid, frame.pc);
                    return Trap::Fault(fault);
                }
            }
        }
        Trap::Tick(frame)
    }

    fn dispatch(&mut self, pid: Pid) {
        let kernel = self.kernel;
        loop {
            if kernel.is_killed(pid) {
                let _ = kernel.terminate_killed(pid);
                break;
            }
            let Some((frame, handle)) = kernel.user_context(pid) else {
                log::error!(target: "cpu", "{}: {} has no user context", self.id, pid);
                break;
            };
            match self.execute(pid, frame, handle) {
                Trap::Tick(frame) => {
                    kernel.save_frame(pid, frame);
                    if kernel.tick(pid) {
                        self.stats.preemptions += 1;
                        break;
                    }
                }
                Trap::Syscall(frame, number) => {
                    kernel.save_frame(pid, frame);
                    self.stats.syscalls += 1;
                    if !self.syscall(pid, number, &frame) {
                        break;
                    }
                }
                Trap::Fault(fault) => {
                    self.stats.faults += 1;
                    log::warn!(target: "cpu", "{}: {} faulted ({:?}); killing", self.id, pid, fault);
                    kernel.kill_task(pid);
                }
            }
        }
        kernel.switch_out(pid, self.id);
    }

    /// Handles a syscall trap. Returns false when the task left the CPU.
    fn syscall(&mut self, pid: Pid, number: u32, frame: &TrapFrame) -> bool {
        let args = Args::from_frame(frame);
        let mut ctx = Context::new(self.kernel, pid, self.id);
        let result = self.syscalls.dispatch(number as usize, &mut ctx, &args);
        match result {
            Ok(value) => {
                self.kernel.update_frame(pid, |f| f.set_return(value as u32));
                true
            }
            Err(Error::Reschedule) => {
                self.kernel.update_frame(pid, |f| f.pc = f.pc.wrapping_sub(INSN_SIZE as u32));
                false
            }
            Err(Error::Yield) => {
                self.kernel.update_frame(pid, |f| f.set_return(0));
                self.kernel.yield_task(pid);
                false
            }
            Err(Error::TaskExit) => false,
            Err(err) => {
                log::debug!(target: "syscall", "{} syscall {} failed: {}", pid, number, err);
                self.kernel.update_frame(pid, |f| f.set_return(ERR_RETURN));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::KernelConfig,
        loader::ImageRegistry,
        syscall::{SYS_EXIT, SYS_REPORT, SYS_YIELD},
        task::TaskState,
        user::{asm::Asm, isa::Reg, programs},
    };

    fn kernel_with(child: Asm) -> Kernel {
        let mut registry = ImageRegistry::new();
        registry
            .install("/init", programs::init_image("/child").unwrap())
            .install("/child", child.link("main").unwrap());
        let kernel = Kernel::new(KernelConfig::default(), registry).unwrap();
        kernel.boot("/init").unwrap();
        kernel
    }

    #[test]
    fn child_reports_then_exits_and_is_reaped() {
        let mut child = Asm::new();
        child
            .label("main")
            .li(Reg::R1, 7)
            .sys(SYS_REPORT)
            .sys(SYS_YIELD)
            .li(Reg::R1, 8)
            .sys(SYS_REPORT)
            .sys(SYS_EXIT);
        let kernel = kernel_with(child);
        let mut cpu = Cpu::new(CpuId::BOOT, &kernel);
        let stats = cpu.run(1_000);
        assert!(stats.dispatches < 1_000);
        let values: alloc::vec::Vec<u32> = kernel.reports().iter().map(|r| r.value).collect();
        assert_eq!(values, [7, 8]);
        let rows = kernel.list_tasks();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, TaskState::Sleeping);
        assert_eq!(kernel.space_stats().live, 1);
    }

    #[test]
    fn faulting_task_is_killed_and_reaped() {
        let mut child = Asm::new();
        child.label("main").li(Reg::R1, 0x7000_0000).ld(Reg::R2, Reg::R1, 0).sys(SYS_REPORT);
        let kernel = kernel_with(child);
        let stats = Cpu::new(CpuId::BOOT, &kernel).run(1_000);
        assert_eq!(stats.faults, 1);
        assert!(kernel.reports().is_empty());
        assert_eq!(kernel.list_tasks().len(), 1);
    }

    #[test]
    fn spinning_task_is_preempted_by_ticks() {
        let mut child = Asm::new();
        child.label("main").jmp("main");
        let kernel = kernel_with(child);
        let mut cpu = Cpu::new(CpuId::BOOT, &kernel);
        let stats = cpu.run(20);
        assert_eq!(stats.dispatches, 20);
        assert!(stats.preemptions > 0);
        assert!(kernel.ticks() > 0);
    }

    #[test]
    fn failed_syscall_returns_minus_one() {
        let mut child = Asm::new();
        child.label("main").sys(30).mov(Reg::R1, Reg::R0).sys(SYS_REPORT).sys(SYS_EXIT);
        let kernel = kernel_with(child);
        Cpu::new(CpuId::BOOT, &kernel).run(1_000);
        assert_eq!(kernel.reports()[0].value, ERR_RETURN);
    }
}
