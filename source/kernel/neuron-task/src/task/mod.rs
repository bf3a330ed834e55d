// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task table: fixed-capacity slots, identity, group fan-out and reparenting
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; lifecycle scenarios in tests/
//! PUBLIC API: TaskTable, Task, TaskState, Role, StackRegion, AsBinding
//! DEPENDS_ON: mm::{AsHandle, KernelStackPool}, sched::Scheduler, fs::{FileTable, Inode}, trap::TrapFrame
//! INVARIANTS: Live tasks never exceed capacity; ids are never reused; group size/limit are
//!             written only through the fan-out helpers; every field is mutated under the table lock

pub mod audit;
pub mod lifecycle;
pub mod list;
#[cfg(test)]
mod tests_prop;

extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use core::mem;

use crate::{
    config::SchedPolicy,
    error::{ProcError, Resource},
    fs::{FileTable, Inode},
    mm::{AsHandle, KernelStack, KernelStackPool},
    monitor::WaitKey,
    sched::{SchedInfo, Scheduler},
    trap::TrapFrame,
    types::{CpuId, Pid},
};

/// Lifecycle state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl TaskState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Embryo => "embryo",
            Self::Sleeping => "sleep",
            Self::Runnable => "runble",
            Self::Running => "run",
            Self::Zombie => "zombie",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Main,
    Subthread,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::Main => "MAIN",
            Self::Subthread => "THREAD",
        }
    }
}

/// Guard page plus stack pages: `[begin, begin + PAGE_SIZE)` is the guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackRegion {
    pub begin: usize,
    pub end: usize,
    pub pages: usize,
}

impl StackRegion {
    pub fn overlaps(&self, other: &StackRegion) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

/// How a task references its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsBinding {
    /// MAIN: destroys the space when reaped.
    Owner(AsHandle),
    /// SUBTHREAD: shares the MAIN's space.
    Borrowed(AsHandle),
}

impl AsBinding {
    pub fn handle(self) -> AsHandle {
        match self {
            Self::Owner(h) | Self::Borrowed(h) => h,
        }
    }
}

pub struct Task {
    pub(crate) pid: Pid,
    pub(crate) group: Pid,
    pub(crate) role: Role,
    pub(crate) state: TaskState,
    pub(crate) space: Option<AsBinding>,
    pub(crate) size: usize,
    pub(crate) limit: usize,
    pub(crate) stack: StackRegion,
    pub(crate) parent: Option<Pid>,
    pub(crate) frame: TrapFrame,
    pub(crate) kstack: Option<KernelStack>,
    pub(crate) files: FileTable,
    pub(crate) cwd: Option<Arc<Inode>>,
    pub(crate) killed: bool,
    pub(crate) exit_value: u32,
    pub(crate) chan: Option<WaitKey>,
    pub(crate) wake_at: Option<u64>,
    pub(crate) name: String,
    pub(crate) cpu: Option<CpuId>,
    pub(crate) sched: SchedInfo,
}

impl Task {
    fn vacant() -> Self {
        Self {
            pid: Pid::from_raw(0),
            group: Pid::from_raw(0),
            role: Role::Main,
            state: TaskState::Unused,
            space: None,
            size: 0,
            limit: 0,
            stack: StackRegion::default(),
            parent: None,
            frame: TrapFrame::default(),
            kstack: None,
            files: FileTable::new(),
            cwd: None,
            killed: false,
            exit_value: 0,
            chan: None,
            wake_at: None,
            name: String::new(),
            cpu: None,
            sched: SchedInfo::default(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn group(&self) -> Pid {
        self.group
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn memory_size(&self) -> usize {
        self.size
    }

    pub fn memory_limit(&self) -> usize {
        self.limit
    }

    pub fn stack(&self) -> StackRegion {
        self.stack
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn exit_value(&self) -> u32 {
        self.exit_value
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> Option<AsHandle> {
        self.space.map(AsBinding::handle)
    }

    pub fn binding(&self) -> Option<AsBinding> {
        self.space
    }

    pub fn open_files(&self) -> usize {
        self.files.open_count()
    }

    pub fn cwd(&self) -> Option<&Arc<Inode>> {
        self.cwd.as_ref()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state != TaskState::Unused
    }

    /// Occupied and fully initialised.
    pub(crate) fn is_member(&self) -> bool {
        !matches!(self.state, TaskState::Unused | TaskState::Embryo)
    }
}

pub struct TaskTable {
    slots: Vec<Task>,
    kstacks: KernelStackPool,
    next_pid: u32,
    init: Option<Pid>,
    sched: Scheduler,
}

impl TaskTable {
    pub fn new(capacity: usize, kernel_stacks: usize, policy: SchedPolicy) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Task::vacant);
        Self {
            slots,
            kstacks: KernelStackPool::new(kernel_stacks),
            next_pid: Pid::INIT.as_raw(),
            init: None,
            sched: Scheduler::new(policy),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims an UNUSED slot: EMBRYO, fresh id, kernel stack. Returns the slot index.
    pub fn allocate(&mut self) -> Result<usize, ProcError> {
        let slot = self
            .slots
            .iter()
            .position(|t| t.state == TaskState::Unused)
            .ok_or(ProcError::ResourceExhausted(Resource::TaskSlot))?;
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid += 1;
        let Some(kstack) = self.kstacks.alloc() else {
            log::debug!(target: "task", "allocate: no kernel stack for {}", pid);
            return Err(ProcError::ResourceExhausted(Resource::KernelStack));
        };
        let task = &mut self.slots[slot];
        *task = Task::vacant();
        task.pid = pid;
        task.group = pid;
        task.state = TaskState::Embryo;
        task.kstack = Some(kstack);
        Ok(slot)
    }

    /// Returns the slot to UNUSED, freeing the kernel stack. The old contents are handed back
    /// so the caller can release the address-space binding.
    pub fn release(&mut self, slot: usize) -> Task {
        let mut old = mem::replace(&mut self.slots[slot], Task::vacant());
        if let Some(kstack) = old.kstack.take() {
            self.kstacks.free(kstack);
        }
        old
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots.iter().position(|t| t.is_live() && t.pid == pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Task> {
        self.slot_of(pid).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slot_of(pid).map(move |i| &mut self.slots[i])
    }

    pub fn slot(&self, index: usize) -> &Task {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Task {
        &mut self.slots[index]
    }

    pub fn slots(&self) -> &[Task] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Task] {
        &mut self.slots
    }

    /// Occupied slots, including EMBRYO.
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.slots.iter().filter(|t| t.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }

    /// Members of `group` other than `except`.
    pub fn group_peers(&self, group: Pid, except: Pid) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.is_member() && t.group == group && t.pid != except)
            .map(|(i, _)| i)
    }

    /// Writes the new high-water mark to every member of `group`.
    pub fn set_group_size(&mut self, group: Pid, size: usize) {
        for task in self.slots.iter_mut().filter(|t| t.is_member() && t.group == group) {
            task.size = size;
        }
    }

    pub fn set_group_limit(&mut self, group: Pid, limit: usize) {
        for task in self.slots.iter_mut().filter(|t| t.is_member() && t.group == group) {
            task.limit = limit;
        }
    }

    /// Hands `from`'s children to new parents: MAIN children go to init, SUBTHREAD children
    /// to `thread_heir` (or init when absent). Returns true if init inherited a ZOMBIE.
    pub fn reparent_children(&mut self, from: Pid, thread_heir: Option<Pid>) -> bool {
        let init = self.init;
        let mut init_has_zombie = false;
        for task in self.slots.iter_mut().filter(|t| t.is_live() && t.parent == Some(from)) {
            let heir = match task.role {
                Role::Main => init,
                Role::Subthread => thread_heir.or(init),
            };
            task.parent = heir;
            if heir == init && task.state == TaskState::Zombie {
                init_has_zombie = true;
            }
        }
        init_has_zombie
    }

    pub fn init(&self) -> Option<Pid> {
        self.init
    }

    pub(crate) fn set_init(&mut self, pid: Pid) {
        self.init = Some(pid);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn ticks(&self) -> u64 {
        self.sched.ticks()
    }

    pub fn kernel_stacks_in_use(&self) -> usize {
        self.kstacks.in_use()
    }

    /// Picks a runnable task and binds it to `cpu`.
    pub fn pick_next(&mut self, cpu: CpuId) -> Option<Pid> {
        let slot = self.sched.pick(&self.slots)?;
        let task = &mut self.slots[slot];
        task.state = TaskState::Running;
        task.cpu = Some(cpu);
        Some(task.pid)
    }

    /// Makes a fully initialised slot runnable for the first time.
    pub fn admit(&mut self, slot: usize) {
        let task = &mut self.slots[slot];
        self.sched.admit(&mut task.sched);
        task.state = TaskState::Runnable;
    }

    /// Charges a tick to `pid`; true when it must give up the CPU.
    pub fn charge_tick(&mut self, pid: Pid) -> bool {
        match self.slot_of(pid) {
            Some(slot) => self.sched.on_tick(&mut self.slots, slot),
            None => {
                self.sched.advance_clock();
                false
            }
        }
    }

    pub fn advance_clock(&mut self) -> u64 {
        self.sched.advance_clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> TaskTable {
        TaskTable::new(capacity, capacity, SchedPolicy::RoundRobin)
    }

    #[test]
    fn allocate_assigns_monotonic_ids_and_fills_up() {
        let mut table = table(2);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_eq!(table.slot(a).pid(), Pid::from_raw(1));
        assert_eq!(table.slot(b).pid(), Pid::from_raw(2));
        assert_eq!(table.slot(a).state(), TaskState::Embryo);
        assert_eq!(table.allocate().err(), Some(ProcError::ResourceExhausted(Resource::TaskSlot)));
        let old = table.release(a);
        assert_eq!(old.pid(), Pid::from_raw(1));
        let c = table.allocate().unwrap();
        assert_eq!(c, a);
        assert_eq!(table.slot(c).pid(), Pid::from_raw(3));
        assert!(table.get(Pid::from_raw(1)).is_none());
    }

    #[test]
    fn kernel_stack_exhaustion_rolls_back_slot() {
        let mut table = TaskTable::new(4, 1, SchedPolicy::RoundRobin);
        table.allocate().unwrap();
        assert_eq!(
            table.allocate().err(),
            Some(ProcError::ResourceExhausted(Resource::KernelStack))
        );
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.kernel_stacks_in_use(), 1);
    }

    #[test]
    fn fan_out_reaches_every_member() {
        let mut table = table(4);
        let group = Pid::from_raw(1);
        for _ in 0..3 {
            let slot = table.allocate().unwrap();
            table.slot_mut(slot).group = group;
            table.slot_mut(slot).state = TaskState::Runnable;
        }
        let other = table.allocate().unwrap();
        table.slot_mut(other).state = TaskState::Runnable;
        table.set_group_size(group, 8192);
        table.set_group_limit(group, 16384);
        for task in table.iter().filter(|t| t.group() == group) {
            assert_eq!((task.memory_size(), task.memory_limit()), (8192, 16384));
        }
        assert_eq!(table.slot(other).memory_size(), 0);
    }

    #[test]
    fn reparenting_routes_threads_to_heir_and_processes_to_init() {
        let mut table = table(4);
        let init = table.allocate().unwrap();
        let init_pid = table.slot(init).pid();
        table.set_init(init_pid);
        let dying = table.allocate().unwrap();
        let dying_pid = table.slot(dying).pid();
        let proc_child = table.allocate().unwrap();
        let thread_child = table.allocate().unwrap();
        table.slot_mut(proc_child).parent = Some(dying_pid);
        table.slot_mut(proc_child).state = TaskState::Zombie;
        table.slot_mut(thread_child).parent = Some(dying_pid);
        table.slot_mut(thread_child).role = Role::Subthread;
        let heir = Pid::from_raw(77);
        assert!(table.reparent_children(dying_pid, Some(heir)));
        assert_eq!(table.slot(proc_child).parent(), Some(init_pid));
        assert_eq!(table.slot(thread_child).parent(), Some(heir));
    }

    #[test]
    fn stack_regions_overlap_check() {
        let a = StackRegion { begin: 0x1000, end: 0x3000, pages: 1 };
        let b = StackRegion { begin: 0x3000, end: 0x5000, pages: 1 };
        let c = StackRegion { begin: 0x2000, end: 0x4000, pages: 1 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c) && c.overlaps(&b));
    }
}
