// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the task table, scheduler and syscall layer
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, CpuId, VirtAddr
//! DEPENDS_ON: mm::{PAGE_SIZE, USER_TOP}
//! INVARIANTS: Pid 0 is never handed out; VirtAddr always below USER_TOP

use core::fmt;

use crate::mm::{PAGE_SIZE, USER_TOP};

/// Task identifier. Assigned monotonically by the task table and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// First identifier handed out; always the root task.
    pub const INIT: Self = Self(1);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// User virtual address below [`USER_TOP`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if addr < USER_TOP {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<usize> {
        self.0.checked_add(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_rejects_kernel_half() {
        assert!(VirtAddr::new(USER_TOP).is_none());
        assert!(VirtAddr::new(USER_TOP - 1).is_some());
        assert!(VirtAddr::page_aligned(PAGE_SIZE + 1).is_none());
        assert_eq!(VirtAddr::page_aligned(PAGE_SIZE).map(VirtAddr::raw), Some(PAGE_SIZE));
    }

    #[test]
    fn pid_display_is_raw_number() {
        assert_eq!(alloc::format!("{}", Pid::from_raw(42)), "42");
        assert_eq!(Pid::INIT.as_raw(), 1);
    }
}
