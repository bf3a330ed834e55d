// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Lifecycle operations: fork, exec, exit, wait, kill, threads, memory limits
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; task/tests_prop.rs; tests/lifecycle.rs, tests/scenarios.rs
//! PUBLIC API: Kernel::{fork, exec, exit, wait, kill, thread_create, thread_exit, thread_join,
//!             set_memory_limit, grow_memory, sleep_ticks, terminate_killed}
//! DEPENDS_ON: task::TaskTable, monitor, mm::AddressSpaceManager, loader::ImageLoader
//! INVARIANTS: Every visible mutation happens under the table lock; a failing operation leaves
//!             the caller's state untouched; an owning address space is destroyed exactly once,
//!             when its MAIN is reaped with no other task attached
//!
//! Blocking operations return `Poll::Pending` after committing SLEEPING. The caller (the
//! syscall layer) retries the whole operation after wakeup, which re-checks every condition.

extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use core::task::Poll;

use super::{AsBinding, Role, StackRegion, Task, TaskState, TaskTable};
use crate::{
    config::{
        KillScope, SubthreadExec, SubthreadExit, DEFAULT_STACK_PAGES, MAXARG, MAX_NAME_LEN,
        MAX_STACK_PAGES, MIN_STACK_PAGES,
    },
    error::{ProcError, Resource},
    fs::{FileTable, Inode},
    kernel::Kernel,
    loader::LoadedImage,
    mm::{pg_round_up, AddressSpaceError, AddressSpaceManager, AsHandle, PAGE_SIZE},
    monitor::{self, WaitKey},
    trap::{TrapFrame, FAKE_RETURN_PC, SP},
    types::Pid,
};

/// Fresh image with its stack laid out, not yet bound to a task.
pub(crate) struct BuiltImage {
    pub handle: AsHandle,
    pub size: usize,
    pub stack: StackRegion,
    pub frame: TrapFrame,
    pub name: String,
}

/// What fork copies from the parent while the table lock is held.
struct ForkSource {
    handle: AsHandle,
    size: usize,
    limit: usize,
    stack: StackRegion,
    frame: TrapFrame,
    files: FileTable,
    cwd: Option<Arc<Inode>>,
    name: String,
}

fn basename(path: &str) -> String {
    let last = path.rsplit('/').find(|part| !part.is_empty()).unwrap_or(path);
    last.chars().take(MAX_NAME_LEN).collect()
}

/// Drops `pid`'s reference; an owner destroys the space, which must then be unreferenced.
fn release_binding(spaces: &mut AddressSpaceManager, binding: AsBinding, pid: Pid) {
    match binding {
        AsBinding::Owner(handle) => match spaces.detach(handle, pid) {
            Ok(0) => {
                if let Err(err) = spaces.destroy(handle) {
                    panic!("kernel invariant: destroying address space of {} failed: {:?}", pid, err);
                }
            }
            Ok(left) => panic!(
                "kernel invariant: {} reaped while {} tasks still share its address space",
                pid, left
            ),
            Err(err) => panic!("kernel invariant: {} owned a dead address space: {:?}", pid, err),
        },
        AsBinding::Borrowed(handle) => {
            if let Err(err) = spaces.detach(handle, pid) {
                panic!("kernel invariant: {} borrowed a dead address space: {:?}", pid, err);
            }
        }
    }
}

/// Sets the kill flag on matching members and wakes sleepers. The root task is exempt.
fn mark_killed(table: &mut TaskTable, pred: impl Fn(&Task) -> bool) -> usize {
    let init = table.init();
    let mut hit = 0;
    for task in table.slots_mut() {
        if !task.is_member() || Some(task.pid) == init || !pred(task) {
            continue;
        }
        task.killed = true;
        if task.state == TaskState::Sleeping {
            task.state = TaskState::Runnable;
            task.chan = None;
        }
        hit += 1;
    }
    hit
}

/// Maps the thread stack `[base, top)`: guard page, argument and fake return word.
fn install_thread_stack(
    spaces: &mut AddressSpaceManager,
    handle: AsHandle,
    base: usize,
    top: usize,
    arg: u32,
    tid: Pid,
) -> Result<(), AddressSpaceError> {
    spaces.clear_user_access(handle, base)?;
    spaces.write_u32(handle, top - 8, FAKE_RETURN_PC)?;
    spaces.write_u32(handle, top - 4, arg)?;
    spaces.attach(handle, tid)
}

impl Kernel {
    /// Loads `path` into a fresh address space and appends guard page, stack and arguments.
    pub(crate) fn build_image(
        &self,
        path: &str,
        argv: &[&str],
        stack_pages: usize,
        limit: usize,
    ) -> Result<BuiltImage, ProcError> {
        let mut spaces = self.spaces.lock();
        let loaded = self.loader.load(path, &mut spaces)?;
        match Self::lay_out_stack(&mut spaces, loaded, argv, stack_pages, limit) {
            Ok((size, stack, frame)) => {
                Ok(BuiltImage { handle: loaded.handle, size, stack, frame, name: basename(path) })
            }
            Err(err) => {
                if let Err(destroy) = spaces.destroy(loaded.handle) {
                    log::error!(target: "task", "exec: cleanup of {} failed: {:?}", path, destroy);
                }
                Err(err)
            }
        }
    }

    fn lay_out_stack(
        spaces: &mut AddressSpaceManager,
        image: LoadedImage,
        argv: &[&str],
        pages: usize,
        limit: usize,
    ) -> Result<(usize, StackRegion, TrapFrame), ProcError> {
        let handle = image.handle;
        let base = pg_round_up(image.size);
        let top = (pages + 1)
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| base.checked_add(bytes))
            .ok_or(ProcError::ResourceExhausted(Resource::Frames))?;
        if limit != 0 && top > limit {
            return Err(ProcError::LimitExceeded);
        }
        spaces.grow(handle, image.size, top)?;
        spaces.clear_user_access(handle, base)?;

        let floor = base + PAGE_SIZE;
        let overflow = ProcError::Validation("arguments do not fit on the stack");
        let mut sp = top;
        let mut ptrs: Vec<u32> = Vec::with_capacity(argv.len() + 1);
        for arg in argv {
            sp = sp.checked_sub(arg.len() + 1).ok_or(overflow)? & !3;
            if sp < floor {
                return Err(overflow);
            }
            let mut bytes = Vec::with_capacity(arg.len() + 1);
            bytes.extend_from_slice(arg.as_bytes());
            bytes.push(0);
            spaces.copy_out(handle, sp, &bytes)?;
            ptrs.push(sp as u32);
        }
        ptrs.push(0);
        let words = 3 + ptrs.len();
        let sp = sp.checked_sub(words * 4).filter(|sp| *sp >= floor).ok_or(overflow)?;
        let header = [FAKE_RETURN_PC, argv.len() as u32, (sp + 12) as u32];
        let mut ustack = Vec::with_capacity(words * 4);
        for word in header.into_iter().chain(ptrs) {
            ustack.extend_from_slice(&word.to_le_bytes());
        }
        spaces.copy_out(handle, sp, &ustack)?;
        Ok((top, StackRegion { begin: base, end: top, pages }, TrapFrame::entry(image.entry, sp)))
    }

    /// Admits a filesystem transaction or puts `pid` to sleep until the log has room.
    pub fn begin_op(&self, pid: Pid) -> Poll<()> {
        let mut log = self.log.lock();
        if log.try_admit() {
            return Poll::Ready(());
        }
        let mut table = self.table.lock();
        monitor::sleep_releasing(&mut table, pid, WaitKey::LogSpace, log);
        Poll::Pending
    }

    pub fn end_op(&self) {
        let freed = self.log.lock().finish();
        if freed {
            monitor::wakeup(&mut self.table.lock(), WaitKey::LogSpace);
        }
    }

    /// Duplicates `cur` into a new MAIN task with a copied address space.
    pub fn fork(&self, cur: Pid) -> Result<Pid, ProcError> {
        let (slot, child, src) = {
            let mut table = self.table.lock();
            let me = table.get(cur).ok_or(ProcError::NotFound)?;
            let handle = me.address_space().ok_or(ProcError::NotFound)?;
            if me.limit != 0 && me.size > me.limit {
                return Err(ProcError::LimitExceeded);
            }
            let src = ForkSource {
                handle,
                size: me.size,
                limit: me.limit,
                stack: me.stack,
                frame: me.frame,
                files: me.files.dup(),
                cwd: me.cwd.clone(),
                name: me.name.clone(),
            };
            let slot = table.allocate()?;
            (slot, table.slot(slot).pid(), src)
        };

        let copy = self.spaces.lock().duplicate(src.handle, src.size);
        let mut table = self.table.lock();
        let handle = match copy {
            Ok(handle) => handle,
            Err(err) => {
                table.release(slot);
                log::debug!(target: "task", "fork: {} duplicate failed: {:?}", cur, err);
                return Err(err.into());
            }
        };
        let attached = self.spaces.lock().attach(handle, child);
        if let Err(err) = attached {
            self.discard_image(handle);
            table.release(slot);
            return Err(err.into());
        }
        let task = table.slot_mut(slot);
        task.role = Role::Main;
        task.group = child;
        task.parent = Some(cur);
        task.space = Some(AsBinding::Owner(handle));
        task.size = src.size;
        task.limit = src.limit;
        task.stack = src.stack;
        task.frame = src.frame;
        task.frame.set_return(0);
        task.files = src.files;
        task.cwd = src.cwd;
        task.name = src.name;
        table.admit(slot);
        log::debug!(target: "task", "fork: {} -> {}", cur, child);
        Ok(child)
    }

    /// Replaces the image of `cur`. `stack_pages` selects exec-with-stack-size.
    pub fn exec(
        &self,
        cur: Pid,
        path: &str,
        argv: &[&str],
        stack_pages: Option<usize>,
    ) -> Result<Poll<()>, ProcError> {
        let pages = match stack_pages {
            Some(p) if !(MIN_STACK_PAGES..=MAX_STACK_PAGES).contains(&p) => {
                return Err(ProcError::Validation("stack page count out of range"));
            }
            Some(p) => p,
            None => DEFAULT_STACK_PAGES,
        };
        if argv.len() > MAXARG {
            return Err(ProcError::Validation("too many arguments"));
        }
        let limit = {
            let mut table = self.table.lock();
            let me = table.get(cur).ok_or(ProcError::NotFound)?;
            let (role, group, limit) = (me.role, me.group, me.limit);
            if role == Role::Subthread && self.config().exec_from_subthread == SubthreadExec::Refuse {
                return Err(ProcError::InvalidRole);
            }
            if role == Role::Main
                && table.group_peers(group, cur).next().is_some()
                && self.sweep_threads(&mut table, cur, group).is_pending()
            {
                return Ok(Poll::Pending);
            }
            limit
        };

        if self.begin_op(cur).is_pending() {
            return Ok(Poll::Pending);
        }
        let built = self.build_image(path, argv, pages, limit);
        self.end_op();
        let built = built?;

        let mut table = self.table.lock();
        let Some(slot) = table.slot_of(cur) else {
            self.discard_image(built.handle);
            return Err(ProcError::NotFound);
        };
        let (role, group, old, limit) = {
            let me = table.slot(slot);
            (me.role, me.group, me.space, me.limit)
        };
        if limit != 0 && built.size > limit {
            self.discard_image(built.handle);
            return Err(ProcError::LimitExceeded);
        }
        match role {
            Role::Main => {
                // Threads created while the image was being built.
                if table.group_peers(group, cur).next().is_some()
                    && self.sweep_threads(&mut table, cur, group).is_pending()
                {
                    self.discard_image(built.handle);
                    return Ok(Poll::Pending);
                }
            }
            Role::Subthread => {
                let killed = mark_killed(&mut table, |t| t.group == group && t.pid != cur);
                log::debug!(target: "task", "exec: {} leaves group {}, {} killed", cur, group, killed);
            }
        }

        {
            let mut spaces = self.spaces.lock();
            if let Err(err) = spaces.attach(built.handle, cur) {
                if let Err(destroy) = spaces.destroy(built.handle) {
                    log::error!(target: "task", "exec: cleanup failed: {:?}", destroy);
                }
                return Err(err.into());
            }
            if let Some(old) = old {
                release_binding(&mut spaces, old, cur);
            }
        }
        let me = table.slot_mut(slot);
        me.role = Role::Main;
        me.group = cur;
        me.space = Some(AsBinding::Owner(built.handle));
        me.size = built.size;
        me.stack = built.stack;
        me.frame = built.frame;
        me.name = built.name;
        log::debug!(target: "task", "exec: {} now runs {}", cur, path);
        Ok(Poll::Ready(()))
    }

    /// Kills every other member of `group`, reaps those already dead and sleeps `main` until
    /// the rest follow.
    fn sweep_threads(&self, table: &mut TaskTable, main: Pid, group: Pid) -> Poll<()> {
        let peers: Vec<usize> = table.group_peers(group, main).collect();
        let mut alive = false;
        let mut spaces = self.spaces.lock();
        for slot in peers {
            let task = table.slot_mut(slot);
            if task.state == TaskState::Zombie {
                Self::reclaim_thread(table, &mut spaces, slot);
                continue;
            }
            task.killed = true;
            if task.state == TaskState::Sleeping {
                task.state = TaskState::Runnable;
                task.chan = None;
            }
            alive = true;
        }
        drop(spaces);
        if alive {
            monitor::sleep_locked(table, main, WaitKey::Task(main));
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }

    /// Frees a SUBTHREAD slot: kernel stack, private stack pages, address-space reference.
    fn reclaim_thread(table: &mut TaskTable, spaces: &mut AddressSpaceManager, slot: usize) -> u32 {
        let old = table.release(slot);
        if let Some(binding) = old.space {
            let handle = binding.handle();
            if !old.stack.is_empty() {
                if let Err(err) = spaces.unmap_range(handle, old.stack.begin, old.stack.end) {
                    log::error!(target: "task", "reap: unmapping stack of {} failed: {:?}", old.pid, err);
                }
            }
            release_binding(spaces, binding, old.pid);
            let top = table.get(old.group).map(Task::memory_size);
            if !old.stack.is_empty() && top == Some(old.stack.end) {
                table.set_group_size(old.group, old.stack.begin);
            }
        }
        log::debug!(target: "task", "reaped thread {} value={}", old.pid, old.exit_value);
        old.exit_value
    }

    fn reclaim_main(&self, table: &mut TaskTable, slot: usize) -> Pid {
        let old = table.release(slot);
        if let Some(binding) = old.space {
            release_binding(&mut self.spaces.lock(), binding, old.pid);
        }
        log::debug!(target: "task", "reaped {}", old.pid);
        old.pid
    }

    /// Closes descriptors and drops the cwd inside a transaction.
    fn release_fs(&self, cur: Pid) -> Poll<()> {
        let has_cwd = {
            let mut table = self.table.lock();
            let Some(me) = table.get_mut(cur) else {
                return Poll::Ready(());
            };
            let closed = me.files.close_all();
            if closed > 0 {
                log::trace!(target: "task", "{} closed {} files", cur, closed);
            }
            me.cwd.is_some()
        };
        if !has_cwd {
            return Poll::Ready(());
        }
        if self.begin_op(cur).is_pending() {
            return Poll::Pending;
        }
        let cwd = self.table.lock().get_mut(cur).and_then(|t| t.cwd.take());
        drop(cwd);
        self.end_op();
        Poll::Ready(())
    }

    /// Terminates a MAIN task and its group. Ready means the task is now a ZOMBIE.
    pub fn exit(&self, cur: Pid) -> Result<Poll<()>, ProcError> {
        {
            let mut table = self.table.lock();
            let me = table.get(cur).ok_or(ProcError::NotFound)?;
            if me.state == TaskState::Zombie {
                return Ok(Poll::Ready(()));
            }
            if me.role == Role::Subthread {
                match self.config().exit_from_subthread {
                    SubthreadExit::Reject => return Err(ProcError::InvalidRole),
                    SubthreadExit::RedirectToThreadExit => {
                        drop(table);
                        return self.thread_exit(cur, 0);
                    }
                }
            }
            if table.init() == Some(cur) {
                panic!("kernel invariant: root task {} exiting", cur);
            }
            let group = me.group;
            if self.sweep_threads(&mut table, cur, group).is_pending() {
                return Ok(Poll::Pending);
            }
        }
        if self.release_fs(cur).is_pending() {
            return Ok(Poll::Pending);
        }

        let mut table = self.table.lock();
        let me = table.get_mut(cur).ok_or(ProcError::NotFound)?;
        me.state = TaskState::Zombie;
        me.chan = None;
        let parent = me.parent;
        if table.reparent_children(cur, None) {
            if let Some(init) = table.init() {
                monitor::wakeup(&mut table, WaitKey::Task(init));
            }
        }
        if let Some(parent) = parent {
            monitor::wakeup(&mut table, WaitKey::Task(parent));
        }
        log::debug!(target: "task", "exit: {} is a zombie", cur);
        Ok(Poll::Ready(()))
    }

    /// Terminates a SUBTHREAD with `value` for its joiner.
    ///
    /// Panics when `cur` is a MAIN task.
    pub fn thread_exit(&self, cur: Pid, value: u32) -> Result<Poll<()>, ProcError> {
        {
            let table = self.table.lock();
            let me = table.get(cur).ok_or(ProcError::NotFound)?;
            if me.role == Role::Main {
                panic!("kernel invariant: thread_exit called by MAIN task {}", cur);
            }
            if me.state == TaskState::Zombie {
                return Ok(Poll::Ready(()));
            }
        }
        if self.release_fs(cur).is_pending() {
            return Ok(Poll::Pending);
        }

        let mut table = self.table.lock();
        let me = table.get_mut(cur).ok_or(ProcError::NotFound)?;
        me.exit_value = value;
        me.state = TaskState::Zombie;
        me.chan = None;
        let (parent, group) = (me.parent, me.group);
        if table.reparent_children(cur, Some(group)) {
            if let Some(init) = table.init() {
                monitor::wakeup(&mut table, WaitKey::Task(init));
            }
        }
        if let Some(parent) = parent {
            monitor::wakeup(&mut table, WaitKey::Task(parent));
        }
        monitor::wakeup(&mut table, WaitKey::Task(group));
        log::debug!(target: "task", "thread_exit: {} value={}", cur, value);
        Ok(Poll::Ready(()))
    }

    /// Reaps a ZOMBIE MAIN child of `cur` and returns its id.
    ///
    /// Fails with `NoChildren` when `cur` has no MAIN children or has been killed. The root
    /// task is the exception: it never gets `NoChildren` and sleeps until an orphan is
    /// reparented to it and exits.
    pub fn wait(&self, cur: Pid) -> Result<Poll<Pid>, ProcError> {
        let mut table = self.table.lock();
        let killed = table.get(cur).ok_or(ProcError::NotFound)?.killed;
        let mut have_kids = false;
        let mut zombie = None;
        for (slot, task) in table.slots().iter().enumerate() {
            if task.is_member() && task.parent == Some(cur) && task.role == Role::Main {
                have_kids = true;
                if task.state == TaskState::Zombie {
                    zombie = Some(slot);
                    break;
                }
            }
        }
        if let Some(slot) = zombie {
            return Ok(Poll::Ready(self.reclaim_main(&mut table, slot)));
        }
        if killed || (!have_kids && table.init() != Some(cur)) {
            return Err(ProcError::NoChildren);
        }
        monitor::sleep_locked(&mut table, cur, WaitKey::Task(cur));
        Ok(Poll::Pending)
    }

    /// Reaps SUBTHREAD `tid` created by `cur` and returns its exit value.
    pub fn thread_join(&self, cur: Pid, tid: Pid) -> Result<Poll<u32>, ProcError> {
        let mut table = self.table.lock();
        let killed = table.get(cur).ok_or(ProcError::NotFound)?.killed;
        let slot = table.slot_of(tid).ok_or(ProcError::NotFound)?;
        let target = table.slot(slot);
        if target.role == Role::Main {
            return Err(ProcError::InvalidRole);
        }
        if target.parent != Some(cur) || !target.is_member() {
            return Err(ProcError::NotFound);
        }
        if target.state == TaskState::Zombie {
            let value = Self::reclaim_thread(&mut table, &mut self.spaces.lock(), slot);
            return Ok(Poll::Ready(value));
        }
        if killed {
            return Err(ProcError::Killed);
        }
        monitor::sleep_locked(&mut table, cur, WaitKey::Task(cur));
        Ok(Poll::Pending)
    }

    /// Starts a SUBTHREAD of `cur`'s group at `entry` with `arg` as its only argument.
    pub fn thread_create(&self, cur: Pid, entry: usize, arg: u32) -> Result<Pid, ProcError> {
        let mut table = self.table.lock();
        let me = table.get(cur).ok_or(ProcError::NotFound)?;
        let handle = me.address_space().ok_or(ProcError::NotFound)?;
        let (group, size, limit) = (me.group, me.size, me.limit);
        let pages = me.stack.pages.max(MIN_STACK_PAGES);
        let mut frame = me.frame;
        let (files, cwd, name) = (me.files.dup(), me.cwd.clone(), me.name.clone());

        let base = pg_round_up(size);
        let top = base
            .checked_add((pages + 1) * PAGE_SIZE)
            .ok_or(ProcError::ResourceExhausted(Resource::Frames))?;
        if limit != 0 && top > limit {
            return Err(ProcError::LimitExceeded);
        }
        let slot = table.allocate()?;
        let tid = table.slot(slot).pid();
        let carved = {
            let mut spaces = self.spaces.lock();
            match spaces.grow(handle, size, top) {
                Ok(_) => {
                    let installed = install_thread_stack(&mut spaces, handle, base, top, arg, tid);
                    if installed.is_err() {
                        if let Err(err) = spaces.unmap_range(handle, base, top) {
                            log::error!(target: "task", "thread_create: rollback failed: {:?}", err);
                        }
                    }
                    installed
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = carved {
            table.release(slot);
            log::debug!(target: "task", "thread_create: {} failed: {:?}", cur, err);
            return Err(err.into());
        }

        table.set_group_size(group, top);
        frame.pc = entry as u32;
        frame.regs[SP] = (top - 8) as u32;
        frame.set_return(0);
        let task = table.slot_mut(slot);
        task.role = Role::Subthread;
        task.group = group;
        task.parent = Some(cur);
        task.space = Some(AsBinding::Borrowed(handle));
        task.size = top;
        task.limit = limit;
        task.stack = StackRegion { begin: base, end: top, pages };
        task.frame = frame;
        task.files = files;
        task.cwd = cwd;
        task.name = name;
        table.admit(slot);
        log::debug!(target: "task", "thread_create: {} -> {} stack {:#x}..{:#x}", cur, tid, base, top);
        Ok(tid)
    }

    /// Sets the kill flag on `target` per the configured scope.
    ///
    /// The root task is never marked; killing it alone fails with `InvalidRole`.
    pub fn kill(&self, target: Pid) -> Result<(), ProcError> {
        let scope = self.config().kill_scope;
        let mut table = self.table.lock();
        let hit = mark_killed(&mut table, |t| match scope {
            KillScope::Group => t.group == target,
            KillScope::Task => t.pid == target,
        });
        if hit == 0 {
            if table.init() == Some(target) {
                return Err(ProcError::InvalidRole);
            }
            return Err(ProcError::NotFound);
        }
        log::debug!(target: "task", "kill: {} matched {} tasks", target, hit);
        Ok(())
    }

    /// Sets the memory ceiling of the group containing `target`; 0 removes it.
    pub fn set_memory_limit(&self, target: Pid, limit: i64) -> Result<(), ProcError> {
        if limit < 0 {
            return Err(ProcError::Validation("negative memory limit"));
        }
        let limit = usize::try_from(limit).map_err(|_| ProcError::Validation("memory limit too large"))?;
        let mut table = self.table.lock();
        let task = table.get(target).filter(|t| t.is_member()).ok_or(ProcError::NotFound)?;
        let (group, size) = (task.group, task.size);
        if limit != 0 && size > limit {
            return Err(ProcError::LimitExceeded);
        }
        table.set_group_limit(group, limit);
        Ok(())
    }

    /// Grows or shrinks the group's memory by `delta` bytes; returns the previous size.
    ///
    /// A shrink never goes below the top of any stack in the group, MAIN or SUBTHREAD.
    pub fn grow_memory(&self, cur: Pid, delta: isize) -> Result<usize, ProcError> {
        let mut table = self.table.lock();
        let me = table.get(cur).ok_or(ProcError::NotFound)?;
        let handle = me.address_space().ok_or(ProcError::NotFound)?;
        let (group, size, limit) = (me.group, me.size, me.limit);
        let new_size = if delta >= 0 {
            size.checked_add(delta.unsigned_abs())
        } else {
            size.checked_sub(delta.unsigned_abs())
        }
        .ok_or(ProcError::Validation("size out of range"))?;
        if new_size > size && limit != 0 && new_size > limit {
            return Err(ProcError::LimitExceeded);
        }
        if new_size < size {
            let floor = table
                .iter()
                .filter(|t| t.group == group && t.is_member())
                .map(|t| t.stack.end)
                .max()
                .unwrap_or(0);
            if new_size < floor {
                return Err(ProcError::Validation("shrink would release a live stack"));
            }
        }
        {
            let mut spaces = self.spaces.lock();
            if new_size > size {
                spaces.grow(handle, size, new_size)?;
            } else {
                spaces.shrink(handle, size, new_size)?;
            }
        }
        table.set_group_size(group, new_size);
        Ok(size)
    }

    /// Sleeps `cur` for `ticks` timer ticks.
    pub fn sleep_ticks(&self, cur: Pid, ticks: u64) -> Result<Poll<()>, ProcError> {
        let mut table = self.table.lock();
        let now = table.ticks();
        let me = table.get_mut(cur).ok_or(ProcError::NotFound)?;
        let deadline = *me.wake_at.get_or_insert(now.saturating_add(ticks));
        if now >= deadline {
            me.wake_at = None;
            return Ok(Poll::Ready(()));
        }
        if me.killed {
            me.wake_at = None;
            return Err(ProcError::Killed);
        }
        monitor::sleep_locked(&mut table, cur, WaitKey::Ticks);
        Ok(Poll::Pending)
    }

    /// Safe-point handler for a killed task: MAIN exits, SUBTHREAD thread-exits with 0.
    pub fn terminate_killed(&self, pid: Pid) -> Poll<()> {
        let role = self.table.lock().get(pid).map(Task::role);
        let outcome = match role {
            Some(Role::Main) => self.exit(pid),
            Some(Role::Subthread) => self.thread_exit(pid, 0),
            None => return Poll::Ready(()),
        };
        outcome.unwrap_or_else(|err| {
            log::error!(target: "task", "terminate {} failed: {}", pid, err);
            Poll::Ready(())
        })
    }
}
