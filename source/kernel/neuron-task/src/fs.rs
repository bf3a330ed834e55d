// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Filesystem-facing state held by tasks: open files, cwd, transaction admission
//! OWNERS: @kernel-team
//! PUBLIC API: OpenFile, Inode, FileTable, TxnLog, LogState
//! DEPENDS_ON: config::NOFILE
//! INVARIANTS: Handles are shared by reference count; outstanding transactions <= capacity

extern crate alloc;

use alloc::{string::String, sync::Arc};

use spin::{Mutex, MutexGuard};

use crate::config::NOFILE;

/// An open file description shared between duplicated descriptors.
#[derive(Debug)]
pub struct OpenFile {
    pub path: String,
}

#[derive(Debug)]
pub struct Inode {
    pub path: String,
}

impl Inode {
    pub fn new(path: &str) -> Arc<Self> {
        Arc::new(Self { path: String::from(path) })
    }
}

/// Per-task descriptor table.
#[derive(Debug, Default, Clone)]
pub struct FileTable {
    slots: [Option<Arc<OpenFile>>; NOFILE],
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `file` in the lowest free descriptor.
    pub fn install(&mut self, file: Arc<OpenFile>) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(file);
        Some(fd)
    }

    pub fn get(&self, fd: usize) -> Option<&Arc<OpenFile>> {
        self.slots.get(fd).and_then(Option::as_ref)
    }

    /// Duplicates every descriptor; each shared file gains one reference.
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Drops every descriptor and returns how many were open.
    pub fn close_all(&mut self) -> usize {
        self.slots.iter_mut().filter_map(Option::take).count()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[derive(Debug)]
pub struct LogState {
    outstanding: usize,
    capacity: usize,
    completed: u64,
}

impl LogState {
    /// Admits one more operation if the log has room.
    pub fn try_admit(&mut self) -> bool {
        if self.outstanding < self.capacity {
            self.outstanding += 1;
            true
        } else {
            false
        }
    }

    /// Ends one operation. Returns true when space was freed for a waiter.
    pub fn finish(&mut self) -> bool {
        if self.outstanding == 0 {
            log::error!(target: "fs", "LOG: end_op without matching begin_op");
            return false;
        }
        self.outstanding -= 1;
        self.completed += 1;
        true
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

/// Admission gate standing in for the write-ahead log's `begin_op`/`end_op` bracket.
pub struct TxnLog {
    state: Mutex<LogState>,
}

impl TxnLog {
    pub fn new(capacity: usize) -> Self {
        Self { state: Mutex::new(LogState { outstanding: 0, capacity, completed: 0 }) }
    }

    pub fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock()
    }
}
