// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulated user memory: page tables, frame budget, address spaces, kernel stacks
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpaceManager, AsHandle, AddressSpaceError, PageFlags, KernelStackPool
//! DEPENDS_ON: types::Pid
//! INVARIANTS: User mappings stay below USER_TOP; frames are accounted on map/unmap

pub mod address_space;
pub mod kstack;
pub mod page_table;

pub use address_space::{AddressSpace, AddressSpaceError, AddressSpaceManager, AsHandle};
pub use kstack::{KernelStack, KernelStackPool};
pub use page_table::{MapError, PageFlags, PAGE_SIZE};

/// First address of the kernel half; user mappings live strictly below.
pub const USER_TOP: usize = 0x8000_0000;

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

static_assertions::const_assert_eq!(USER_TOP % PAGE_SIZE, 0);
