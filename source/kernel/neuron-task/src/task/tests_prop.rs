// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the task table and group bookkeeping
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Slot conservation and id freshness under allocate/release
//!   - Group size/limit agreement across members after arbitrary operations
//!   - Memory limit enforcement
//!   - Join idempotence
//!   - Sleep/wakeup delivery
//!
//! TEST_SCENARIOS:
//!   - slots_never_exceed_capacity_and_ids_stay_dead(): reaped ids never reappear
//!   - group_members_agree_on_size_and_limit(): fan-out keeps members identical; shrinks stop
//!     at the highest live stack
//!   - limit_accepts_iff_size_fits(): setMemoryLimit succeeds iff size <= limit; growth past it fails
//!   - joined_thread_cannot_be_joined_again(): second join reports NotFound
//!   - wakeup_after_sleep_is_never_lost(): sleeper becomes runnable on its key only

extern crate alloc;

use alloc::{collections::BTreeSet, vec::Vec};
use core::task::Poll;

use proptest::prelude::*;

use super::{TaskState, TaskTable};
use crate::{
    config::{KernelConfig, SchedPolicy},
    error::ProcError,
    kernel::Kernel,
    loader::ImageRegistry,
    mm::PAGE_SIZE,
    monitor::{self, WaitKey},
    types::Pid,
    user::asm::Asm,
};

#[derive(Debug, Clone)]
enum SlotOp {
    Allocate,
    Release(usize),
}

fn arb_slot_op() -> impl Strategy<Value = SlotOp> {
    prop_oneof![Just(SlotOp::Allocate), (0usize..8).prop_map(SlotOp::Release)]
}

#[derive(Debug, Clone)]
enum GroupOp {
    Spawn,
    Grow(isize),
    Limit(i64),
    Retire(usize),
}

fn arb_group_op() -> impl Strategy<Value = GroupOp> {
    prop_oneof![
        Just(GroupOp::Spawn),
        (-3isize..4).prop_map(GroupOp::Grow),
        (0i64..24).prop_map(|pages| GroupOp::Limit(pages * PAGE_SIZE as i64)),
        (0usize..4).prop_map(GroupOp::Retire),
    ]
}

fn booted() -> (Kernel, Pid) {
    let mut asm = Asm::new();
    asm.label("main").jmp("main");
    let mut registry = ImageRegistry::new();
    registry.install("/init", asm.link("main").unwrap());
    let kernel = Kernel::new(KernelConfig::default(), registry).unwrap();
    let init = kernel.boot("/init").unwrap();
    (kernel, init)
}

fn group_view(kernel: &Kernel, group: Pid) -> Vec<(usize, usize)> {
    kernel
        .table()
        .iter()
        .filter(|t| t.group() == group)
        .map(|t| (t.memory_size(), t.memory_limit()))
        .collect()
}

proptest! {
    #[test]
    fn slots_never_exceed_capacity_and_ids_stay_dead(ops in prop::collection::vec(arb_slot_op(), 1..64)) {
        let capacity = 4;
        let mut table = TaskTable::new(capacity, capacity, SchedPolicy::RoundRobin);
        let mut reaped = BTreeSet::new();
        for op in ops {
            match op {
                SlotOp::Allocate => {
                    if let Ok(slot) = table.allocate() {
                        prop_assert!(!reaped.contains(&table.slot(slot).pid()));
                    }
                }
                SlotOp::Release(i) => {
                    let live: Vec<usize> = (0..capacity).filter(|&s| table.slot(s).state() != TaskState::Unused).collect();
                    if let Some(&slot) = live.get(i % live.len().max(1)) {
                        reaped.insert(table.release(slot).pid());
                    }
                }
            }
            prop_assert!(table.live_count() <= capacity);
            prop_assert!(table.iter().all(|t| !reaped.contains(&t.pid())));
        }
    }

    #[test]
    fn group_members_agree_on_size_and_limit(ops in prop::collection::vec(arb_group_op(), 1..24)) {
        let (kernel, init) = booted();
        let mut threads: Vec<Pid> = Vec::new();
        for op in ops {
            match op {
                GroupOp::Spawn => {
                    if let Ok(tid) = kernel.thread_create(init, 0, 0) {
                        threads.push(tid);
                    }
                }
                GroupOp::Grow(pages) => {
                    let floor = kernel.table().iter().filter(|t| t.group() == init).map(|t| t.stack().end).max();
                    let before = kernel.table().get(init).unwrap().memory_size();
                    let delta = pages * PAGE_SIZE as isize;
                    let result = kernel.grow_memory(init, delta);
                    if let (true, Some(floor)) = (pages < 0, floor) {
                        prop_assert_eq!(result.is_ok(), before.checked_sub(delta.unsigned_abs()).is_some_and(|s| s >= floor));
                    }
                }
                GroupOp::Limit(limit) => {
                    let _ = kernel.set_memory_limit(init, limit);
                }
                GroupOp::Retire(i) => {
                    if !threads.is_empty() {
                        let tid = threads.remove(i % threads.len());
                        prop_assert_eq!(kernel.thread_exit(tid, 0), Ok(Poll::Ready(())));
                        prop_assert_eq!(kernel.thread_join(init, tid), Ok(Poll::Ready(0)));
                    }
                }
            }
            let view = group_view(&kernel, init);
            prop_assert!(view.windows(2).all(|w| w[0] == w[1]));
            prop_assert_eq!(kernel.check_invariants(), Ok(()));
        }
    }

    #[test]
    fn limit_accepts_iff_size_fits(pages in 1usize..16, grow in 1usize..4) {
        let (kernel, init) = booted();
        let size = kernel.table().get(init).unwrap().memory_size();
        let limit = pages * PAGE_SIZE;
        let result = kernel.set_memory_limit(init, limit as i64);
        prop_assert_eq!(result.is_ok(), size <= limit);
        if result.is_err() {
            prop_assert_eq!(result, Err(ProcError::LimitExceeded));
            prop_assert_eq!(kernel.table().get(init).unwrap().memory_limit(), 0);
            return Ok(());
        }
        let over = limit - size + grow;
        prop_assert_eq!(kernel.grow_memory(init, over as isize), Err(ProcError::LimitExceeded));
        prop_assert_eq!(kernel.table().get(init).unwrap().memory_size(), size);
    }

    #[test]
    fn joined_thread_cannot_be_joined_again(value in any::<u32>(), extra in 0usize..3) {
        let (kernel, init) = booted();
        let tid = kernel.thread_create(init, 0, 0).unwrap();
        for _ in 0..extra {
            kernel.thread_create(init, 0, 0).unwrap();
        }
        prop_assert_eq!(kernel.thread_exit(tid, value), Ok(Poll::Ready(())));
        prop_assert_eq!(kernel.thread_join(init, tid), Ok(Poll::Ready(value)));
        prop_assert_eq!(kernel.thread_join(init, tid), Err(ProcError::NotFound));
    }

    #[test]
    fn wakeup_after_sleep_is_never_lost(noise in prop::collection::vec(0u32..4, 0..8), key in 0u32..4) {
        let as_key = |k: u32| match k {
            0 => WaitKey::LogSpace,
            1 => WaitKey::Ticks,
            other => WaitKey::Task(Pid::from_raw(100 + other)),
        };
        let mut table = TaskTable::new(2, 2, SchedPolicy::RoundRobin);
        let slot = table.allocate().unwrap();
        table.slot_mut(slot).state = TaskState::Running;
        let pid = table.slot(slot).pid();
        monitor::sleep_locked(&mut table, pid, as_key(key));
        for k in noise.into_iter().filter(|k| *k != key) {
            monitor::wakeup(&mut table, as_key(k));
            prop_assert_eq!(table.get(pid).unwrap().state(), TaskState::Sleeping);
        }
        prop_assert_eq!(monitor::wakeup(&mut table, as_key(key)), 1);
        prop_assert_eq!(table.get(pid).unwrap().state(), TaskState::Runnable);
    }
}
