// SPDX-License-Identifier: MPL-2.0

//! A single mapping of a (sub-)range of a [`VMObject`] into one [`VMSpace`](crate::space::VMSpace).

use alloc::sync::Weak;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::object::VMObject;
use crate::prot::{VMProt, VirtualRange};
use crate::space::{RegionId, VMSpace};

#[derive(Debug)]
struct VMRegionInner {
    object: VMObject,
    object_start: usize,
    prot: VMProt,
}

/// A live mapping of one [`VMObject`] into one [`VMSpace`] at a fixed
/// virtual range with a protection set.
///
/// Constructed only by [`VMSpace::map_object`], [`VMSpace::map_stack`] and
/// [`VMSpace::fork`]. Dropping the last `Arc<VMRegion>` tears the mapping
/// down: the owning space's record is freed and the hardware mapping is
/// removed. An explicit [`VMSpace::unmap_region`] call does the same thing
/// up front; either way teardown runs exactly once, guarded by
/// `torn_down`.
#[derive(Debug)]
pub struct VMRegion {
    inner: Mutex<VMRegionInner>,
    /// Fixed for the region's lifetime: where it lives and how big it is.
    range: VirtualRange,
    space: Weak<VMSpace>,
    pub(crate) record: RegionId,
    /// Guards teardown against running twice — once from an explicit
    /// `VMSpace::unmap_region` call and again from `Drop`, or from two
    /// overlapping explicit unmaps.
    torn_down: AtomicBool,
}

impl VMRegion {
    pub(crate) fn new(
        object: VMObject,
        object_start: usize,
        range: VirtualRange,
        prot: VMProt,
        space: Weak<VMSpace>,
        record: RegionId,
    ) -> Self {
        Self {
            inner: Mutex::new(VMRegionInner {
                object,
                object_start,
                prot,
            }),
            range,
            space,
            record,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Transitions this region to torn-down state, returning `true` if
    /// this call is the one that did it. Subsequent calls (from another
    /// explicit unmap or from `Drop`) see `false` and must not repeat the
    /// teardown.
    pub(crate) fn mark_torn_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn object(&self) -> VMObject {
        self.inner.lock().object.clone()
    }

    pub fn object_start(&self) -> usize {
        self.inner.lock().object_start
    }

    pub fn prot(&self) -> VMProt {
        self.inner.lock().prot
    }

    pub fn is_cow(&self) -> bool {
        self.inner.lock().prot.is_cow()
    }

    /// Flips the CoW bit. The caller (only ever [`VMSpace`], under its own
    /// lock) is responsible for reinstalling the hardware mapping
    /// afterwards so that writes actually start trapping.
    pub(crate) fn set_cow(&self, cow: bool) {
        self.inner.lock().prot.set_cow(cow);
    }

    /// Rebinds this region onto a fresh object of identical layout,
    /// clearing CoW. `object_start` is left untouched: the replacement
    /// object is always a same-size copy of the one it replaces, so the
    /// region keeps mapping the same offset into it. Used only by
    /// [`VMSpace::try_pagefault`] when breaking copy-on-write.
    pub(crate) fn rebind(&self, object: VMObject) {
        let mut inner = self.inner.lock();
        inner.object = object;
        inner.prot.set_cow(false);
    }

    pub fn range(&self) -> VirtualRange {
        self.range
    }

    pub fn start(&self) -> usize {
        self.range.start
    }

    pub fn end(&self) -> usize {
        self.range.end()
    }

    pub fn size(&self) -> usize {
        self.range.size
    }

    pub(crate) fn space(&self) -> Option<alloc::sync::Arc<VMSpace>> {
        self.space.upgrade()
    }
}

impl Drop for VMRegion {
    fn drop(&mut self) {
        if self.mark_torn_down() {
            if let Some(space) = self.space.upgrade() {
                space.teardown_region(self.record, self);
            }
        }
    }
}
