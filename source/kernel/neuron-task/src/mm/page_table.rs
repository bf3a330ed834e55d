// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single-level user page table backed by simulated physical frames.

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, vec};

use bitflags::bitflags;

use super::USER_TOP;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in page-table entries.
    pub struct PageFlags: u8 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const USER = 1 << 3;
    }
}

impl PageFlags {
    /// Ordinary user data/text/stack page.
    pub const USER_RW: Self =
        Self::from_bits_truncate(Self::VALID.bits() | Self::READ.bits() | Self::WRITE.bits() | Self::USER.bits());
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Mapping extends into the kernel half.
    OutOfRange,
    /// Mapping collides with an existing entry.
    Overlap,
    /// No entry exists for the address.
    NotMapped,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
}

struct Entry {
    flags: PageFlags,
    frame: Box<[u8]>,
}

/// Sparse page table keyed by virtual page number.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Entry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    fn vpn(va: usize) -> Result<usize, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if va >= USER_TOP {
            return Err(MapError::OutOfRange);
        }
        Ok(va / PAGE_SIZE)
    }

    /// Maps a freshly zeroed frame at `va`.
    pub fn map(&mut self, va: usize, flags: PageFlags) -> Result<(), MapError> {
        let vpn = Self::vpn(va)?;
        if !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if self.entries.contains_key(&vpn) {
            return Err(MapError::Overlap);
        }
        self.entries.insert(vpn, Entry { flags, frame: vec![0u8; PAGE_SIZE].into_boxed_slice() });
        Ok(())
    }

    /// Removes the entry at `va`, dropping its frame.
    pub fn unmap(&mut self, va: usize) -> Result<(), MapError> {
        let vpn = Self::vpn(va)?;
        self.entries.remove(&vpn).map(|_| ()).ok_or(MapError::NotMapped)
    }

    pub fn lookup(&self, va: usize) -> Option<PageFlags> {
        self.entries.get(&(va / PAGE_SIZE)).map(|entry| entry.flags)
    }

    /// Clears `flags` on an existing entry; `VALID` cannot be cleared this way.
    pub fn clear_flags(&mut self, va: usize, flags: PageFlags) -> Result<(), MapError> {
        let vpn = Self::vpn(va)?;
        let entry = self.entries.get_mut(&vpn).ok_or(MapError::NotMapped)?;
        entry.flags.remove(flags - PageFlags::VALID);
        Ok(())
    }

    pub fn frame(&self, va: usize) -> Option<&[u8]> {
        self.entries.get(&(va / PAGE_SIZE)).map(|entry| &entry.frame[..])
    }

    pub fn frame_mut(&mut self, va: usize) -> Option<&mut [u8]> {
        self.entries.get_mut(&(va / PAGE_SIZE)).map(|entry| &mut entry.frame[..])
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Iterates `(va, flags, frame)` in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, PageFlags, &[u8])> + '_ {
        self.entries.iter().map(|(vpn, entry)| (vpn * PAGE_SIZE, entry.flags, &entry.frame[..]))
    }
}

/// Counts physical frames handed to user address spaces.
#[derive(Debug)]
pub struct FramePool {
    capacity: usize,
    in_use: usize,
}

impl FramePool {
    pub const fn new(capacity: usize) -> Self {
        Self { capacity, in_use: 0 }
    }

    #[must_use]
    pub fn try_reserve(&mut self) -> bool {
        if self.in_use < self.capacity {
            self.in_use += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self, frames: usize) {
        self.in_use = self.in_use.saturating_sub(frames);
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }
}
