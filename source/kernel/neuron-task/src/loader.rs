// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program-image loading into fresh address spaces
//! OWNERS: @runtime
//! PUBLIC API: ImageLoader, ImageRegistry, ProgramImage, Segment, LoadedImage, LoadError
//! DEPENDS_ON: mm::AddressSpaceManager
//! INVARIANTS: load is all-or-nothing: on error no address space survives
//!
//! Images are stored pre-linked in memory; segment validation mirrors the checks an ELF
//! loader performs on program headers (file size within memory size, no wrap-around,
//! page-aligned base).

extern crate alloc;

use alloc::{collections::BTreeMap, string::String, vec::Vec};

use crate::mm::{AddressSpaceError, AddressSpaceManager, AsHandle, PAGE_SIZE, USER_TOP};

/// One loadable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub data: Vec<u8>,
    /// Bytes of memory the segment occupies; the tail past `data` is zero-filled.
    pub mem_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    /// Highest address any segment reaches.
    pub fn extent(&self) -> usize {
        self.segments.iter().map(|s| s.vaddr.saturating_add(s.mem_size)).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("no such image")]
    NotFound,
    #[error("malformed image: {0}")]
    BadImage(&'static str),
    #[error("address space: {0}")]
    Memory(AddressSpaceError),
}

impl From<AddressSpaceError> for LoadError {
    fn from(value: AddressSpaceError) -> Self {
        Self::Memory(value)
    }
}

/// Freshly built image, not yet attached to any task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub handle: AsHandle,
    /// High-water mark after loading, before the stack is appended.
    pub size: usize,
    pub entry: usize,
}

/// Builds a new address space from the image found at `path`.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &str, spaces: &mut AddressSpaceManager) -> Result<LoadedImage, LoadError>;
}

/// In-memory image store keyed by absolute path.
#[derive(Default)]
pub struct ImageRegistry {
    images: BTreeMap<String, ProgramImage>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, path: &str, image: ProgramImage) -> &mut Self {
        self.images.insert(String::from(path), image);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.images.contains_key(path)
    }

    fn validate(image: &ProgramImage) -> Result<(), LoadError> {
        if image.segments.is_empty() {
            return Err(LoadError::BadImage("no loadable segments"));
        }
        for seg in &image.segments {
            if seg.mem_size < seg.data.len() {
                return Err(LoadError::BadImage("file size exceeds memory size"));
            }
            let end = seg.vaddr.checked_add(seg.mem_size).ok_or(LoadError::BadImage("segment wraps"))?;
            if end > USER_TOP {
                return Err(LoadError::BadImage("segment reaches kernel space"));
            }
            if seg.vaddr % PAGE_SIZE != 0 {
                return Err(LoadError::BadImage("segment not page aligned"));
            }
        }
        if image.entry >= image.extent() {
            return Err(LoadError::BadImage("entry outside image"));
        }
        Ok(())
    }

    fn populate(
        image: &ProgramImage,
        spaces: &mut AddressSpaceManager,
        handle: AsHandle,
    ) -> Result<usize, LoadError> {
        let mut size = 0;
        let mut segments: Vec<&Segment> = image.segments.iter().collect();
        segments.sort_by_key(|seg| seg.vaddr);
        for seg in segments {
            size = spaces.grow(handle, size, seg.vaddr + seg.mem_size)?;
            spaces.copy_out(handle, seg.vaddr, &seg.data)?;
        }
        Ok(size)
    }
}

impl ImageLoader for ImageRegistry {
    fn load(&self, path: &str, spaces: &mut AddressSpaceManager) -> Result<LoadedImage, LoadError> {
        let image = self.images.get(path).ok_or(LoadError::NotFound)?;
        Self::validate(image)?;
        let handle = spaces.create()?;
        match Self::populate(image, spaces, handle) {
            Ok(size) => Ok(LoadedImage { handle, size, entry: image.entry }),
            Err(err) => {
                if let Err(destroy) = spaces.destroy(handle) {
                    log::error!(target: "loader", "LOAD: cleanup of {} failed: {:?}", path, destroy);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn image(mem_size: usize) -> ProgramImage {
        ProgramImage {
            entry: 0,
            segments: vec![Segment { vaddr: 0, data: vec![1, 2, 3, 4], mem_size }],
        }
    }

    #[test]
    fn loads_into_fresh_space() {
        let mut registry = ImageRegistry::new();
        registry.install("/bin/a", image(PAGE_SIZE + 8));
        let mut spaces = AddressSpaceManager::new(8);
        let loaded = registry.load("/bin/a", &mut spaces).unwrap();
        assert_eq!(loaded.size, PAGE_SIZE + 8);
        assert_eq!(spaces.read_u32(loaded.handle, 0), Ok(0x0403_0201));
        assert_eq!(spaces.mapped_pages(loaded.handle), Ok(2));
    }

    #[test]
    fn failed_load_leaves_no_space_behind() {
        let mut registry = ImageRegistry::new();
        registry.install("/bin/big", image(4 * PAGE_SIZE));
        let mut spaces = AddressSpaceManager::new(2);
        let err = registry.load("/bin/big", &mut spaces).unwrap_err();
        assert_eq!(err, LoadError::Memory(AddressSpaceError::OutOfFrames));
        assert_eq!(spaces.live(), 0);
        assert_eq!(spaces.frames_in_use(), 0);
    }

    #[test]
    fn malformed_images_rejected() {
        let mut registry = ImageRegistry::new();
        registry.install("/bin/short", image(2));
        let mut spaces = AddressSpaceManager::new(2);
        assert!(matches!(registry.load("/bin/short", &mut spaces), Err(LoadError::BadImage(_))));
        assert_eq!(registry.load("/nope", &mut spaces), Err(LoadError::NotFound));
    }
}
