// SPDX-License-Identifier: MPL-2.0

//! Backing stores for virtual memory: [`VMObject`] and its anonymous
//! variant.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::collab::{Frame, MemoryManager};
use crate::error::{Error, Result};
use crate::prot::{is_page_aligned, PAGE_SIZE};

/// The policy an anonymous object's owning space applies to its live
/// mappings when the process is forked.
///
/// Kept on the object rather than on each [`VMRegion`](crate::region::VMRegion)
/// so that a single decision governs every mapping of a shared object
/// consistently.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ForkAction {
    /// Re-install live mappings read-only in both parent and child; the
    /// first writer on either side breaks copy-on-write. The default for
    /// writable private anonymous mappings.
    BecomeCoW,
    /// Keep mapping the same object writable in both parent and child
    /// (shared memory).
    Share,
    /// Drop the mapping in the child (transient kernel-thread or
    /// signal-handler stacks).
    Ignore,
}

/// A contiguous, page-aligned, RAM-backed memory object.
///
/// `size` is fixed at construction. The frame list is immutable after
/// construction: a copy-on-write break never mutates an existing object,
/// it allocates a fresh one and rebinds the region (see
/// [`VMSpace::try_pagefault`](crate::space::VMSpace::try_pagefault)).
#[derive(Debug)]
pub struct AnonymousVMObject {
    frames: Vec<Frame>,
    fork_action: ForkAction,
    shared: AtomicBool,
}

impl AnonymousVMObject {
    /// Allocates an anonymous object backed by `size / PAGE_SIZE` freshly
    /// zeroed physical frames. `size` must be a nonzero multiple of
    /// [`PAGE_SIZE`].
    ///
    /// Fails with [`Error::NoMemory`] if frames are unavailable, or
    /// [`Error::Invalid`] if `size` is not page-aligned.
    pub fn alloc(size: usize, mm: &dyn MemoryManager) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::Invalid);
        }
        let frames = mm.alloc_frames(size / PAGE_SIZE)?;
        Ok(Arc::new(Self {
            frames,
            fork_action: ForkAction::BecomeCoW,
            shared: AtomicBool::new(false),
        }))
    }

    /// Size in bytes, a multiple of [`PAGE_SIZE`].
    pub fn size(&self) -> usize {
        self.frames.len() * PAGE_SIZE
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn fork_action(&self) -> ForkAction {
        self.fork_action
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Marks the object as shared (used for shared-memory objects) and
    /// sets its fork action to [`ForkAction::Share`].
    pub fn set_shared(self: &Arc<Self>) {
        // `fork_action` is set at construction time in `alloc`; shared
        // objects are built via `alloc_shared` instead of mutating an
        // existing private one, since the action is meant to be fixed
        // for the lifetime of the object.
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Allocates an anonymous object intended for sharing across forks:
    /// `fork_action` is [`ForkAction::Share`] and `shared` starts `true`.
    pub fn alloc_shared(size: usize, mm: &dyn MemoryManager) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::Invalid);
        }
        let frames = mm.alloc_frames(size / PAGE_SIZE)?;
        Ok(Arc::new(Self {
            frames,
            fork_action: ForkAction::Share,
            shared: AtomicBool::new(true),
        }))
    }

    /// Allocates an anonymous object meant to be dropped (not mapped) in
    /// the child on fork, e.g. a kernel-thread or signal-handler stack.
    pub fn alloc_ignored(size: usize, mm: &dyn MemoryManager) -> Result<Arc<Self>> {
        if size == 0 || !is_page_aligned(size) {
            return Err(Error::Invalid);
        }
        let frames = mm.alloc_frames(size / PAGE_SIZE)?;
        Ok(Arc::new(Self {
            frames,
            fork_action: ForkAction::Ignore,
            shared: AtomicBool::new(false),
        }))
    }
}

/// A contiguous, page-aligned backing store for virtual memory.
///
/// Only the `Anonymous` variant exists today; file-backed and device
/// objects are out of scope. Adding a second variant later is a
/// non-breaking enum addition.
#[derive(Clone, Debug)]
pub enum VMObject {
    Anonymous(Arc<AnonymousVMObject>),
}

impl VMObject {
    pub fn size(&self) -> usize {
        match self {
            Self::Anonymous(obj) => obj.size(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }

    pub fn as_anonymous(&self) -> Option<&Arc<AnonymousVMObject>> {
        match self {
            Self::Anonymous(obj) => Some(obj),
        }
    }
}

impl From<Arc<AnonymousVMObject>> for VMObject {
    fn from(obj: Arc<AnonymousVMObject>) -> Self {
        Self::Anonymous(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMemoryManager;

    #[test]
    fn alloc_rejects_unaligned_or_zero_size() {
        let mm = MockMemoryManager::new();
        assert_eq!(
            AnonymousVMObject::alloc(0, &mm).unwrap_err(),
            Error::Invalid
        );
        assert_eq!(
            AnonymousVMObject::alloc(1, &mm).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn alloc_default_fork_action_is_cow() {
        let mm = MockMemoryManager::new();
        let obj = AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap();
        assert_eq!(obj.fork_action(), ForkAction::BecomeCoW);
        assert!(!obj.is_shared());
        assert_eq!(obj.size(), PAGE_SIZE);
        assert_eq!(obj.frames().len(), 1);
    }

    #[test]
    fn alloc_shared_is_shared_and_share_policy() {
        let mm = MockMemoryManager::new();
        let obj = AnonymousVMObject::alloc_shared(PAGE_SIZE, &mm).unwrap();
        assert_eq!(obj.fork_action(), ForkAction::Share);
        assert!(obj.is_shared());
    }

    #[test]
    fn alloc_ignored_policy() {
        let mm = MockMemoryManager::new();
        let obj = AnonymousVMObject::alloc_ignored(PAGE_SIZE, &mm).unwrap();
        assert_eq!(obj.fork_action(), ForkAction::Ignore);
        assert!(!obj.is_shared());
    }
}
