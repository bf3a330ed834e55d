// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of per-task kernel stacks.

extern crate alloc;

use alloc::vec::Vec;

/// Bytes reserved for each kernel stack.
pub const KSTACK_SIZE: usize = 4096;

/// Owned kernel stack. Must be handed back to the pool it came from.
#[must_use = "kernel stacks must be returned to the pool"]
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    index: u32,
}

impl KernelStack {
    pub fn index(&self) -> u32 {
        self.index
    }
}

pub struct KernelStackPool {
    capacity: u32,
    cursor: u32,
    free: Vec<u32>,
}

impl KernelStackPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
        Self { capacity, cursor: 0, free: Vec::new() }
    }

    pub fn alloc(&mut self) -> Option<KernelStack> {
        if let Some(index) = self.free.pop() {
            return Some(KernelStack { index });
        }
        if self.cursor == self.capacity {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(KernelStack { index })
    }

    pub fn free(&mut self, stack: KernelStack) {
        self.free.push(stack.index);
    }

    pub fn in_use(&self) -> usize {
        (self.cursor as usize) - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded_and_recycles() {
        let mut pool = KernelStackPool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_ne!(a.index(), b.index());
        pool.free(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.alloc().unwrap();
        assert_eq!(c.index(), 0);
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.in_use(), 0);
    }
}
