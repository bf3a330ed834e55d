// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the lifecycle integration tests.

#![allow(dead_code)]

use neuron_task::{
    host, user::programs, Cpu, CpuId, ImageRegistry, Kernel, KernelConfig, Pid, ProgramImage,
};

/// Boots a kernel whose root task forks and execs `first`.
pub fn boot(config: KernelConfig, first: &str, images: Vec<(&str, ProgramImage)>) -> (Kernel, Pid) {
    let mut registry = ImageRegistry::new();
    registry.install("/init", programs::init_image(first).expect("init links"));
    for (path, image) in images {
        registry.install(path, image);
    }
    let kernel = Kernel::new(config, registry).expect("valid config");
    let init = kernel.boot("/init").expect("boot");
    (kernel, init)
}

/// Runs on one CPU until quiescent; panics if the budget runs out first.
pub fn run_single(kernel: &Kernel) {
    let mut cpu = Cpu::new(CpuId::BOOT, kernel);
    let stats = cpu.run(200_000);
    assert!(stats.dispatches < 200_000, "kernel never became quiescent");
}

/// Runs on `cpus` host threads until quiescent.
pub fn run_smp(kernel: &Kernel, cpus: usize) {
    let report = host::run(kernel, cpus, 2_000_000);
    assert!(report.quiescent, "kernel never became quiescent: {:?}", report);
}

pub fn report_values(kernel: &Kernel) -> Vec<u32> {
    kernel.reports().iter().map(|r| r.value).collect()
}

/// Schedules on the boot CPU until `pid` is the one picked, parking everything else.
pub fn run_task(kernel: &Kernel, pid: Pid) {
    loop {
        match kernel.schedule(CpuId::BOOT) {
            Some(p) if p == pid => return,
            Some(other) => park(kernel, other),
            None => panic!("{} is not runnable", pid),
        }
    }
}

/// Takes a RUNNING task off the boot CPU.
pub fn park(kernel: &Kernel, pid: Pid) {
    kernel.yield_task(pid);
    kernel.switch_out(pid, CpuId::BOOT);
}
