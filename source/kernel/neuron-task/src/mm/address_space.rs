// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space management: growth, duplication, reference tracking and user access.

extern crate alloc;

use alloc::{collections::BTreeSet, string::String, vec::Vec};
use core::num::NonZeroU32;

use super::page_table::{FramePool, MapError, PageFlags, PageTable, PAGE_SIZE};
use super::{pg_round_down, pg_round_up, USER_TOP};
use crate::types::Pid;

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    /// Creates a handle from the backing table index.
    fn from_index(index: usize) -> Self {
        // index + 1 is never zero; the table never grows past u32::MAX entries.
        match NonZeroU32::new(index as u32 + 1) {
            Some(raw) => Self(raw),
            None => unreachable!("address-space index overflow"),
        }
    }

    /// Returns the table index backing this handle.
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    #[error("invalid address-space handle")]
    InvalidHandle,
    /// Frame pool is empty.
    #[error("out of physical frames")]
    OutOfFrames,
    /// Requested size reaches into the kernel half.
    #[error("address out of user range")]
    OutOfRange,
    /// Address space still has attached tasks.
    #[error("address space still in use")]
    InUse,
    /// Underlying map operation failed.
    #[error("mapping failed: {0:?}")]
    Mapping(MapError),
    /// User access to an unmapped, guard or read-only page.
    #[error("user fault at {va:#x}")]
    Fault { va: usize },
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

/// Tracks one user address space and the tasks attached to it.
pub struct AddressSpace {
    page_table: PageTable,
    owners: BTreeSet<u32>,
}

impl AddressSpace {
    fn new() -> Self {
        Self { page_table: PageTable::new(), owners: BTreeSet::new() }
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    fn attach(&mut self, pid: u32) {
        self.owners.insert(pid);
    }

    fn detach(&mut self, pid: u32) {
        self.owners.remove(&pid);
    }

    fn refcount(&self) -> usize {
        self.owners.len()
    }
}

/// Manages the collection of user address spaces and the frame budget behind them.
pub struct AddressSpaceManager {
    spaces: Vec<Option<AddressSpace>>,
    frames: FramePool,
    destroyed: u64,
}

impl AddressSpaceManager {
    pub fn new(frames: usize) -> Self {
        Self { spaces: Vec::new(), frames: FramePool::new(frames), destroyed: 0 }
    }

    /// Allocates an empty address space and returns its handle.
    pub fn create(&mut self) -> Result<AsHandle, AddressSpaceError> {
        let space = AddressSpace::new();
        for (index, slot) in self.spaces.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(space);
                return Ok(AsHandle::from_index(index));
            }
        }
        self.spaces.push(Some(space));
        Ok(AsHandle::from_index(self.spaces.len() - 1))
    }

    pub fn get(&self, handle: AsHandle) -> Result<&AddressSpace, AddressSpaceError> {
        self.spaces
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    fn get_mut(&mut self, handle: AsHandle) -> Result<&mut AddressSpace, AddressSpaceError> {
        self.spaces
            .get_mut(handle.index())
            .and_then(|slot| slot.as_mut())
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Maps zeroed user pages covering `[old_size, new_size)`. Either every page is mapped or
    /// none is. Returns the new size; a smaller `new_size` is a no-op returning `old_size`.
    pub fn grow(
        &mut self,
        handle: AsHandle,
        old_size: usize,
        new_size: usize,
    ) -> Result<usize, AddressSpaceError> {
        if new_size > USER_TOP {
            return Err(AddressSpaceError::OutOfRange);
        }
        if new_size <= old_size {
            return Ok(old_size);
        }
        let start = pg_round_up(old_size);
        let space = self.spaces.get_mut(handle.index()).and_then(|slot| slot.as_mut());
        let space = space.ok_or(AddressSpaceError::InvalidHandle)?;
        let mut va = start;
        let mut failure = None;
        while va < new_size {
            if !self.frames.try_reserve() {
                failure = Some(AddressSpaceError::OutOfFrames);
                break;
            }
            if let Err(err) = space.page_table.map(va, PageFlags::USER_RW) {
                self.frames.release(1);
                failure = Some(err.into());
                break;
            }
            va += PAGE_SIZE;
        }
        if let Some(err) = failure {
            let mut undo = start;
            while undo < va {
                if space.page_table.unmap(undo).is_ok() {
                    self.frames.release(1);
                }
                undo += PAGE_SIZE;
            }
            log::debug!(target: "mm", "grow {:#x}->{:#x} rolled back: {:?}", old_size, new_size, err);
            return Err(err);
        }
        Ok(new_size)
    }

    /// Unmaps the pages above `new_size` up to `old_size`; holes are skipped.
    pub fn shrink(
        &mut self,
        handle: AsHandle,
        old_size: usize,
        new_size: usize,
    ) -> Result<usize, AddressSpaceError> {
        if new_size >= old_size {
            return Ok(old_size);
        }
        self.unmap_range(handle, pg_round_up(new_size), pg_round_up(old_size))?;
        Ok(new_size)
    }

    /// Releases every mapped page in `[begin, end)`; both bounds are rounded to pages.
    pub fn unmap_range(
        &mut self,
        handle: AsHandle,
        begin: usize,
        end: usize,
    ) -> Result<usize, AddressSpaceError> {
        let space = self.spaces.get_mut(handle.index()).and_then(|slot| slot.as_mut());
        let space = space.ok_or(AddressSpaceError::InvalidHandle)?;
        let mut released = 0;
        let mut va = pg_round_down(begin);
        while va < pg_round_up(end) {
            if space.page_table.unmap(va).is_ok() {
                released += 1;
            }
            va += PAGE_SIZE;
        }
        self.frames.release(released);
        Ok(released)
    }

    /// Builds a full copy of every mapped page below `size`, preserving page flags.
    pub fn duplicate(&mut self, handle: AsHandle, size: usize) -> Result<AsHandle, AddressSpaceError> {
        let pages: Vec<(usize, PageFlags, Vec<u8>)> = self
            .get(handle)?
            .page_table
            .iter()
            .take_while(|(va, _, _)| *va < size)
            .map(|(va, flags, frame)| (va, flags, frame.to_vec()))
            .collect();
        let copy = self.create()?;
        for (va, flags, bytes) in pages {
            if !self.frames.try_reserve() {
                self.discard(copy);
                return Err(AddressSpaceError::OutOfFrames);
            }
            let space = self.get_mut(copy)?;
            if let Err(err) = space.page_table.map(va, flags) {
                self.frames.release(1);
                self.discard(copy);
                return Err(err.into());
            }
            if let Some(frame) = space.page_table.frame_mut(va) {
                frame.copy_from_slice(&bytes);
            }
        }
        Ok(copy)
    }

    /// Tears down a half-built space that never had owners.
    fn discard(&mut self, handle: AsHandle) {
        if let Err(err) = self.destroy(handle) {
            log::error!(target: "mm", "discard of unowned space failed: {:?}", err);
        }
    }

    /// Frees every frame of `handle` and retires the handle.
    pub fn destroy(&mut self, handle: AsHandle) -> Result<(), AddressSpaceError> {
        let space = self.get(handle)?;
        if space.refcount() != 0 {
            return Err(AddressSpaceError::InUse);
        }
        let pages = space.page_table.mapped_pages();
        self.spaces[handle.index()] = None;
        self.frames.release(pages);
        self.destroyed += 1;
        Ok(())
    }

    /// Turns the page at `va` into a guard page: still mapped, not accessible from user mode.
    pub fn clear_user_access(&mut self, handle: AsHandle, va: usize) -> Result<(), AddressSpaceError> {
        let space = self.get_mut(handle)?;
        space.page_table.clear_flags(pg_round_down(va), PageFlags::USER)?;
        Ok(())
    }

    pub fn attach(&mut self, handle: AsHandle, pid: Pid) -> Result<(), AddressSpaceError> {
        self.get_mut(handle)?.attach(pid.as_raw());
        Ok(())
    }

    /// Drops `pid`'s reference and returns the remaining count.
    pub fn detach(&mut self, handle: AsHandle, pid: Pid) -> Result<usize, AddressSpaceError> {
        let space = self.get_mut(handle)?;
        space.detach(pid.as_raw());
        Ok(space.refcount())
    }

    pub fn refcount(&self, handle: AsHandle) -> Result<usize, AddressSpaceError> {
        Ok(self.get(handle)?.refcount())
    }

    pub fn is_attached(&self, handle: AsHandle, pid: Pid) -> bool {
        self.get(handle).map(|space| space.owners.contains(&pid.as_raw())).unwrap_or(false)
    }

    /// Number of address spaces currently alive.
    pub fn live(&self) -> usize {
        self.spaces.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of address spaces destroyed since boot.
    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    pub fn frames_available(&self) -> usize {
        self.frames.available()
    }

    pub fn mapped_pages(&self, handle: AsHandle) -> Result<usize, AddressSpaceError> {
        Ok(self.get(handle)?.page_table.mapped_pages())
    }

    /// Resolves a user access of `len` bytes that must stay within one page.
    fn user_slice_mut(
        &mut self,
        handle: AsHandle,
        va: usize,
        len: usize,
        write: bool,
    ) -> Result<&mut [u8], AddressSpaceError> {
        let fault = AddressSpaceError::Fault { va };
        let offset = va % PAGE_SIZE;
        if offset + len > PAGE_SIZE || va >= USER_TOP {
            return Err(fault);
        }
        let space = self.get_mut(handle)?;
        let flags = space.page_table.lookup(va).ok_or(fault)?;
        let mut need = PageFlags::VALID | PageFlags::USER | PageFlags::READ;
        if write {
            need |= PageFlags::WRITE;
        }
        if !flags.contains(need) {
            return Err(fault);
        }
        let frame = space.page_table.frame_mut(va).ok_or(fault)?;
        Ok(&mut frame[offset..offset + len])
    }

    /// Reads an aligned little-endian word with user permissions.
    pub fn read_u32(&mut self, handle: AsHandle, va: usize) -> Result<u32, AddressSpaceError> {
        if va % 4 != 0 {
            return Err(AddressSpaceError::Fault { va });
        }
        let bytes = self.user_slice_mut(handle, va, 4, false)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, handle: AsHandle, va: usize, value: u32) -> Result<(), AddressSpaceError> {
        if va % 4 != 0 {
            return Err(AddressSpaceError::Fault { va });
        }
        let bytes = self.user_slice_mut(handle, va, 4, true)?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Atomically adds `delta` to the word at `va`, returning the previous value.
    pub fn fetch_add_u32(
        &mut self,
        handle: AsHandle,
        va: usize,
        delta: u32,
    ) -> Result<u32, AddressSpaceError> {
        let old = self.read_u32(handle, va)?;
        self.write_u32(handle, va, old.wrapping_add(delta))?;
        Ok(old)
    }

    /// Fetches an `N`-byte instruction word; it must not straddle a page.
    pub fn fetch<const N: usize>(&mut self, handle: AsHandle, va: usize) -> Result<[u8; N], AddressSpaceError> {
        if va % N != 0 {
            return Err(AddressSpaceError::Fault { va });
        }
        let bytes = self.user_slice_mut(handle, va, N, false)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Copies `data` into user memory starting at `va`.
    pub fn copy_out(&mut self, handle: AsHandle, va: usize, data: &[u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < data.len() {
            let at = va.checked_add(done).ok_or(AddressSpaceError::Fault { va })?;
            let chunk = (PAGE_SIZE - at % PAGE_SIZE).min(data.len() - done);
            let dst = self.user_slice_mut(handle, at, chunk, true)?;
            dst.copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string of at most `max` bytes out of user memory.
    pub fn copy_in_str(&mut self, handle: AsHandle, va: usize, max: usize) -> Result<String, AddressSpaceError> {
        let mut bytes = Vec::new();
        let mut at = va;
        while bytes.len() < max {
            let chunk = (PAGE_SIZE - at % PAGE_SIZE).min(max - bytes.len());
            let src = self.user_slice_mut(handle, at, chunk, false)?;
            if let Some(nul) = src.iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&src[..nul]);
                return String::from_utf8(bytes).map_err(|_| AddressSpaceError::Fault { va });
            }
            bytes.extend_from_slice(src);
            at += chunk;
        }
        Err(AddressSpaceError::Fault { va })
    }
}
