// SPDX-License-Identifier: MPL-2.0

//! The external collaborators this subsystem depends on but does not
//! implement: the hardware page-table layer and the physical-frame
//! allocator. Both are out of scope (see the subsystem spec, §1) and are
//! modeled here purely as trait interfaces.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Result;
use crate::object::AnonymousVMObject;
use crate::region::VMRegion;

/// A physical page frame handle. Opaque: only the `MemoryManager`
/// collaborator knows how to turn it into bytes or a hardware mapping.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Frame(pub usize);

/// Installs and removes hardware mappings for a [`VMRegion`].
///
/// One `PageDirectory` is owned 1-to-1 by the [`VMSpace`](crate::space::VMSpace)
/// whose mappings it backs.
pub trait PageDirectory: Send + Sync {
    /// Installs hardware mappings for every page in `region.range()`,
    /// resolving to the corresponding frames of `region.object()` starting
    /// at `region.object_start()`. Effective permissions are
    /// `region.prot().effective()`.
    fn map(&self, region: &VMRegion) -> Result<()>;

    /// Removes all hardware mappings installed for `region`. Idempotent.
    fn unmap(&self, region: &VMRegion) -> Result<()>;
}

/// A transient mapping of an [`AnonymousVMObject`] into a kernel-private
/// view, used to bytewise-copy its contents during copy-on-write breaking.
/// Unmapped when dropped.
pub trait KernelView {
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Allocates physical memory and maps it for transient kernel access. The
/// physical page allocator proper lives behind this trait and is out of
/// scope for this crate; this is the `alloc_anonymous`/`map_object` pair
/// from the subsystem spec's external-interfaces section, named here after
/// what each call actually hands back.
pub trait MemoryManager: Send + Sync {
    /// Allocates `count` freshly zeroed physical frames. Used by
    /// [`AnonymousVMObject::alloc`] to back a new anonymous object —
    /// together they implement the spec's `alloc_anonymous(size)`.
    fn alloc_frames(&self, count: usize) -> Result<Vec<Frame>>;

    /// Maps `object` into a transient kernel-private view for the caller
    /// to read or write directly.
    fn map_for_kernel(&self, object: &Arc<AnonymousVMObject>) -> Result<Box<dyn KernelView>>;
}
