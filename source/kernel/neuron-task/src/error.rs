// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the lifecycle operations
//! OWNERS: @kernel-sched-team
//! PUBLIC API: ProcError, Resource
//! DEPENDS_ON: mm::AddressSpaceError, loader::LoadError
//! INVARIANTS: An operation returning Err has not committed any visible state

use crate::{loader::LoadError, mm::AddressSpaceError};

/// Resource that ran out while servicing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Resource {
    #[error("task slot")]
    TaskSlot,
    #[error("kernel stack")]
    KernelStack,
    #[error("physical frames")]
    Frames,
}

/// Errors returned by the typed lifecycle API.
#[must_use = "lifecycle errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    /// Rejected before any mutation.
    #[error("invalid argument: {0}")]
    Validation(&'static str),
    #[error("out of {0}")]
    ResourceExhausted(Resource),
    /// Growth past a nonzero group limit, or a limit below the current size.
    #[error("memory limit exceeded")]
    LimitExceeded,
    #[error("no such task")]
    NotFound,
    #[error("operation not permitted for this task role")]
    InvalidRole,
    #[error("no children to wait for")]
    NoChildren,
    /// The caller was killed while blocked.
    #[error("caller was killed")]
    Killed,
    #[error("image load failed: {0}")]
    Load(LoadError),
}

impl From<AddressSpaceError> for ProcError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfFrames => Self::ResourceExhausted(Resource::Frames),
            AddressSpaceError::OutOfRange => Self::ResourceExhausted(Resource::Frames),
            AddressSpaceError::Fault { .. } => Self::Validation("bad user address"),
            _ => Self::Validation("address space rejected request"),
        }
    }
}

impl From<LoadError> for ProcError {
    fn from(value: LoadError) -> Self {
        match value {
            LoadError::Memory(AddressSpaceError::OutOfFrames) => {
                Self::ResourceExhausted(Resource::Frames)
            }
            other => Self::Load(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_exhaustion_maps_to_resource_error() {
        assert_eq!(
            ProcError::from(AddressSpaceError::OutOfFrames),
            ProcError::ResourceExhausted(Resource::Frames)
        );
        assert_eq!(
            ProcError::from(LoadError::Memory(AddressSpaceError::OutOfFrames)),
            ProcError::ResourceExhausted(Resource::Frames)
        );
        assert_eq!(ProcError::from(LoadError::NotFound), ProcError::Load(LoadError::NotFound));
    }

    #[test]
    fn display_names_the_resource() {
        let text = alloc::format!("{}", ProcError::ResourceExhausted(Resource::KernelStack));
        assert_eq!(text, "out of kernel stack");
    }
}
