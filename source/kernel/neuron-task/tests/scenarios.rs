// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end lifecycle scenarios driven by user programs
//! INTENT: Shared counter across threads, memory limits, failed exec, group teardown, wait
//! DEPS: neuron-task (Kernel, Cpu, host runner, user assembler)
//! TESTS: threads_share_a_counter_*, limit_below_size_*, exec_over_limit_*,
//!        main_exit_tears_down_threads_*, wait_without_children_*

mod common;

use core::task::Poll;

use neuron_task::{
    mm::PAGE_SIZE,
    syscall::{
        ERR_RETURN, SYS_EXEC, SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_REPORT, SYS_SBRK,
        SYS_SETMEMORYLIMIT, SYS_SLEEP, SYS_THREAD_CREATE, SYS_THREAD_EXIT, SYS_THREAD_JOIN,
        SYS_WAIT,
    },
    user::{asm::Asm, isa::Reg},
    CpuId, KernelConfig, ProcError, ProgramImage, SchedPolicy, TaskState,
};

use common::{boot, report_values, run_single, run_smp, run_task};

fn counter_program(iterations: u32) -> ProgramImage {
    let mut asm = Asm::new();
    asm.label("main");
    for tid in ["tid_a", "tid_b"] {
        asm.la(Reg::R1, tid)
            .la(Reg::R2, "worker")
            .la(Reg::R3, "counter")
            .sys(SYS_THREAD_CREATE)
            .mov(Reg::R1, Reg::R0)
            .sys(SYS_REPORT);
    }
    for tid in ["tid_a", "tid_b"] {
        asm.la(Reg::R6, tid)
            .ld(Reg::R1, Reg::R6, 0)
            .li(Reg::R2, 0)
            .sys(SYS_THREAD_JOIN)
            .mov(Reg::R1, Reg::R0)
            .sys(SYS_REPORT);
    }
    asm.la(Reg::R6, "counter").ld(Reg::R1, Reg::R6, 0).sys(SYS_REPORT).sys(SYS_EXIT);

    // Thread stack on entry: [sp] fake return pc, [sp + 4] argument.
    asm.label("worker").ld(Reg::R4, Reg::SP, 4).li(Reg::R5, iterations);
    asm.label("loop")
        .li(Reg::R1, 1)
        .xadd(Reg::R1, Reg::R4, 0)
        .addi(Reg::R5, -1)
        .jnz(Reg::R5, "loop")
        .li(Reg::R1, 0)
        .sys(SYS_THREAD_EXIT);
    asm.data_word("counter", 0).data_word("tid_a", 0).data_word("tid_b", 0);
    asm.link("main").unwrap()
}

#[test]
fn threads_share_a_counter_on_one_cpu() {
    let (kernel, _) = boot(KernelConfig::default(), "/counter", vec![("/counter", counter_program(10_000))]);
    run_single(&kernel);
    assert_eq!(report_values(&kernel), [0, 0, 0, 0, 20_000]);
    assert_eq!(kernel.list_tasks().len(), 1);
}

#[test]
fn threads_share_a_counter_across_cpus() {
    let (kernel, _) = boot(KernelConfig::default(), "/counter", vec![("/counter", counter_program(10_000))]);
    run_smp(&kernel, 3);
    assert_eq!(report_values(&kernel), [0, 0, 0, 0, 20_000]);
    assert_eq!(kernel.space_stats().live, 1);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn threads_share_a_counter_under_feedback_scheduling() {
    let config = KernelConfig::default()
        .with_sched(SchedPolicy::Feedback(Default::default()))
        .with_tick_instructions(16);
    let (kernel, _) = boot(config, "/counter", vec![("/counter", counter_program(2_000))]);
    run_smp(&kernel, 2);
    assert_eq!(report_values(&kernel), [0, 0, 0, 0, 4_000]);
}

#[test]
fn limit_below_size_is_rejected_by_syscall() {
    let mut asm = Asm::new();
    asm.label("main")
        .sys(SYS_GETPID)
        .mov(Reg::R1, Reg::R0)
        .li(Reg::R2, PAGE_SIZE as u32)
        .sys(SYS_SETMEMORYLIMIT)
        .mov(Reg::R1, Reg::R0)
        .sys(SYS_REPORT)
        .li(Reg::R1, 0)
        .sys(SYS_SBRK)
        .mov(Reg::R1, Reg::R0)
        .sys(SYS_REPORT)
        .sys(SYS_EXIT);
    let (kernel, _) = boot(KernelConfig::default(), "/limit", vec![("/limit", asm.link("main").unwrap())]);
    run_single(&kernel);
    let values = report_values(&kernel);
    assert_eq!(values[0], ERR_RETURN);
    assert!(values[1] as usize > PAGE_SIZE);
}

#[test]
fn limit_below_size_leaves_size_unchanged() {
    let (kernel, init) = boot(KernelConfig::default(), "/none", vec![]);
    let before = kernel.table().get(init).unwrap().memory_size();
    kernel.grow_memory(init, PAGE_SIZE as isize).unwrap();
    let size = before + PAGE_SIZE;
    assert_eq!(kernel.set_memory_limit(init, before as i64), Err(ProcError::LimitExceeded));
    let table = kernel.table();
    let task = table.get(init).unwrap();
    assert_eq!((task.memory_size(), task.memory_limit()), (size, 0));
}

#[test]
fn exec_over_limit_keeps_the_old_image_running() {
    let mut parent = Asm::new();
    parent
        .label("main")
        .sys(SYS_GETPID)
        .mov(Reg::R1, Reg::R0)
        .li(Reg::R2, 4 * PAGE_SIZE as u32)
        .sys(SYS_SETMEMORYLIMIT)
        .sys(SYS_FORK)
        .jz(Reg::R0, "child")
        .sys(SYS_WAIT)
        .sys(SYS_EXIT);
    parent
        .label("child")
        .la(Reg::R1, "big")
        .li(Reg::R2, 0)
        .sys(SYS_EXEC)
        .mov(Reg::R1, Reg::R0)
        .sys(SYS_REPORT)
        .li(Reg::R1, 77)
        .sys(SYS_REPORT)
        .sys(SYS_EXIT);
    parent.data_str("big", "/big");

    let mut big = Asm::new();
    big.label("main").li(Reg::R1, 1).sys(SYS_REPORT).sys(SYS_EXIT);
    big.data_zero("blob", 16 * PAGE_SIZE);

    let images = vec![("/parent", parent.link("main").unwrap()), ("/big", big.link("main").unwrap())];
    let (kernel, _) = boot(KernelConfig::default(), "/parent", images);
    run_single(&kernel);
    assert_eq!(report_values(&kernel), [ERR_RETURN, 77]);
    assert_eq!(kernel.space_stats().live, 1);
}

fn teardown_program(thread_body: &dyn Fn(&mut Asm)) -> ProgramImage {
    let mut asm = Asm::new();
    asm.label("main");
    for _ in 0..2 {
        asm.la(Reg::R1, "tid").la(Reg::R2, "thread").li(Reg::R3, 0).sys(SYS_THREAD_CREATE);
    }
    asm.li(Reg::R1, 1).sys(SYS_REPORT).sys(SYS_EXIT);
    asm.label("thread");
    thread_body(&mut asm);
    asm.data_word("tid", 0);
    asm.link("main").unwrap()
}

#[test]
fn main_exit_tears_down_spinning_threads() {
    let image = teardown_program(&|asm: &mut Asm| {
        asm.label("spin").jmp("spin");
    });
    let (kernel, _) = boot(KernelConfig::default(), "/threads", vec![("/threads", image)]);
    run_smp(&kernel, 2);
    assert_eq!(report_values(&kernel), [1]);
    assert_eq!(kernel.list_tasks().len(), 1);
    assert_eq!(kernel.space_stats().live, 1);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn main_exit_tears_down_sleeping_threads() {
    let image = teardown_program(&|asm: &mut Asm| {
        asm.li(Reg::R1, 1_000_000).sys(SYS_SLEEP).li(Reg::R1, 2).sys(SYS_REPORT).sys(SYS_EXIT);
    });
    let (kernel, _) = boot(KernelConfig::default(), "/threads", vec![("/threads", image)]);
    run_single(&kernel);
    assert_eq!(report_values(&kernel), [1]);
    assert_eq!(kernel.list_tasks().len(), 1);
}

#[test]
fn main_exit_through_typed_api_reaps_both_threads() {
    let (kernel, init) = boot(KernelConfig::default(), "/none", vec![]);
    let child = kernel.fork(init).unwrap();
    run_task(&kernel, child);
    let a = kernel.thread_create(child, 0, 0).unwrap();
    let b = kernel.thread_create(child, 0, 0).unwrap();

    assert_eq!(kernel.exit(child), Ok(Poll::Pending));
    kernel.switch_out(child, CpuId::BOOT);
    assert!(kernel.is_killed(a) && kernel.is_killed(b));
    for tid in [a, b] {
        assert_eq!(kernel.terminate_killed(tid), Poll::Ready(()));
    }
    assert_eq!(kernel.table().get(child).unwrap().state(), TaskState::Runnable);
    assert_eq!(kernel.exit(child), Ok(Poll::Ready(())));
    assert!(kernel.table().get(a).is_none());
    assert!(kernel.table().get(b).is_none());
    assert_eq!(kernel.thread_join(child, a), Err(ProcError::NotFound));

    let destroyed = kernel.space_stats().destroyed;
    assert_eq!(kernel.wait(init), Ok(Poll::Ready(child)));
    assert_eq!(kernel.space_stats().destroyed, destroyed + 1);
}

#[test]
fn wait_without_children_returns_immediately() {
    let mut asm = Asm::new();
    asm.label("main").sys(SYS_WAIT).mov(Reg::R1, Reg::R0).sys(SYS_REPORT).sys(SYS_EXIT);
    let (kernel, _) = boot(KernelConfig::default(), "/lonely", vec![("/lonely", asm.link("main").unwrap())]);
    run_single(&kernel);
    assert_eq!(report_values(&kernel), [ERR_RETURN]);
}

#[test]
fn wait_without_children_through_typed_api() {
    let (kernel, init) = boot(KernelConfig::default(), "/none", vec![]);
    let child = kernel.fork(init).unwrap();
    assert_eq!(kernel.wait(child), Err(ProcError::NoChildren));
    assert_eq!(kernel.table().get(child).unwrap().state(), TaskState::Runnable);
}
