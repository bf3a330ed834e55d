// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host runner driving several CPU loops on OS threads
//! OWNERS: @runtime
//! PUBLIC API: run(kernel, cpus, max_dispatches) -> RunReport
//! DEPENDS_ON: cpu::Cpu, parking_lot::{Mutex, Condvar}, std::thread::scope
//! INVARIANTS: Every CPU stops once the kernel is quiescent or the shared dispatch budget is spent;
//!             a panicking CPU propagates its panic to the caller

use std::{
    panic,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    cpu::{Cpu, CpuStats, Round},
    kernel::Kernel,
    types::CpuId,
};

/// How long an idle CPU parks before polling the run queue again.
const IDLE_PARK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub cpus: Vec<CpuStats>,
    /// False when the dispatch budget ran out first.
    pub quiescent: bool,
}

impl RunReport {
    pub fn dispatches(&self) -> u64 {
        self.cpus.iter().map(|c| c.dispatches).sum()
    }
}

/// Parking spot for CPUs with nothing to run.
#[derive(Default)]
struct IdleGate {
    lock: Mutex<()>,
    cv: Condvar,
}

impl IdleGate {
    fn park(&self) {
        let mut guard = self.lock.lock();
        let _ = self.cv.wait_for(&mut guard, IDLE_PARK);
    }

    fn notify(&self) {
        self.cv.notify_all();
    }
}

/// Runs `cpus` scheduler loops concurrently on `kernel`.
pub fn run(kernel: &Kernel, cpus: usize, max_dispatches: u64) -> RunReport {
    let gate = IdleGate::default();
    let stop = AtomicBool::new(false);
    let quiescent = AtomicBool::new(false);
    let dispatched = AtomicU64::new(0);

    let stats: Vec<CpuStats> = thread::scope(|scope| {
        let workers: Vec<_> = (0..cpus.max(1))
            .map(|index| {
                let (gate, stop, quiescent, dispatched) = (&gate, &stop, &quiescent, &dispatched);
                scope.spawn(move || {
                    let mut cpu = Cpu::new(CpuId::from_raw(index as u16), kernel);
                    while !stop.load(Ordering::Acquire) {
                        match cpu.run_once() {
                            Round::Dispatched(_) => {
                                gate.notify();
                                if dispatched.fetch_add(1, Ordering::AcqRel) + 1 >= max_dispatches {
                                    stop.store(true, Ordering::Release);
                                }
                            }
                            Round::Idle => gate.park(),
                            Round::Quiescent => {
                                quiescent.store(true, Ordering::Release);
                                stop.store(true, Ordering::Release);
                                gate.notify();
                            }
                        }
                    }
                    log::debug!(target: "host", "{} stopped: {:?}", cpu.id(), cpu.stats());
                    cpu.stats()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect()
    });

    RunReport { cpus: stats, quiescent: quiescent.load(Ordering::Acquire) }
}
