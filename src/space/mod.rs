// SPDX-License-Identifier: MPL-2.0

//! [`VMSpace`]: the range allocator over a process's virtual-address
//! window, and the entry points for mapping, unmapping, forking and
//! page-fault handling.

mod arena;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::{debug, trace, warn};
use spin::Mutex;

pub use self::arena::RegionId;
use self::arena::{Node, SpaceState};
use crate::collab::{MemoryManager, PageDirectory};
use crate::error::{Error, Result};
use crate::object::{ForkAction, VMObject};
use crate::prot::{is_page_aligned, VMProt, VirtualRange};
use crate::region::VMRegion;

/// A range allocator over a fixed virtual-address window, owning the list
/// of [`VMRegion`]s mapped into it.
///
/// One spinlock (`state`) guards the region list for the duration of any
/// mutation or internal-pointer-returning traversal; it is released
/// before control returns to the caller, and nothing that can allocate,
/// block or fault is ever called while it is held.
pub struct VMSpace {
    page_directory: Arc<dyn PageDirectory>,
    window: VirtualRange,
    state: Mutex<SpaceState>,
}

impl VMSpace {
    /// Creates a space covering `[start, start + size)`, entirely free.
    pub fn new(start: usize, size: usize, page_directory: Arc<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            page_directory,
            window: VirtualRange::new(start, size),
            state: Mutex::new(SpaceState::new(start, size)),
        })
    }

    pub fn window(&self) -> VirtualRange {
        self.window
    }

    /// Bytes currently in used records.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Ensures the record arena can hand out `additional` more ids without
    /// growing either backing `Vec` while `state`'s lock is held for the
    /// carve/fork work that follows. The only allocation happens here,
    /// building replacement storage before any lock is taken; swapping it
    /// in via `absorb_growth` is a move, not an allocation — mirroring the
    /// original's discipline of constructing a node with `new` before
    /// acquiring the space lock.
    fn ensure_capacity(&self, additional: usize) {
        let (spare, nodes_cap) = {
            let state = self.state.lock();
            (state.spare_capacity(), state.node_capacity())
        };
        if spare >= additional {
            return;
        }

        // Doubling (like `Vec`'s own growth) keeps this a rare event
        // instead of paying the build-outside-lock/swap-in cost on
        // nearly every carve.
        let target_cap = (nodes_cap * 2).max(nodes_cap + (additional - spare));
        let grown_nodes = Vec::with_capacity(target_cap);
        let grown_free_ids = Vec::with_capacity(target_cap);

        let mut state = self.state.lock();
        // Another racing carve may have grown the arena (or freed
        // records) between the peek above and this lock; only transplant
        // if still short.
        if state.spare_capacity() < additional {
            state.absorb_growth(grown_nodes, grown_free_ids);
        }
    }

    // -- mapping ----------------------------------------------------

    /// Maps `object` into this space.
    ///
    /// `range.start == 0` means "any free location"; `range.size == 0`
    /// means "the rest of the object starting at `object_start`".
    pub fn map_object(
        self: &Arc<Self>,
        object: VMObject,
        prot: VMProt,
        mut range: VirtualRange,
        object_start: usize,
    ) -> Result<Arc<VMRegion>> {
        if range.size == 0 {
            range.size = object
                .size()
                .checked_sub(object_start)
                .ok_or(Error::Invalid)?;
        }

        if range.size == 0
            || !is_page_aligned(object_start)
            || range.check_alignment().is_err()
            || object_start
                .checked_add(range.size)
                .map_or(true, |end| end > object.size())
        {
            return Err(Error::Invalid);
        }

        // A carve splits at most one free record into a head and a tail;
        // reserve room for both before taking the lock that does it.
        self.ensure_capacity(2);
        let id = {
            let mut state = self.state.lock();
            if range.start == 0 {
                Self::carve_any(&mut state, range.size)?
            } else {
                Self::carve_at(&mut state, range.size, range.start)?
            }
        };

        self.finish_map(id, object, prot, object_start, range.size)
    }

    /// Maps `object` at the top of the highest-address free record large
    /// enough for it (stacks grow downward).
    pub fn map_stack(self: &Arc<Self>, object: VMObject, prot: VMProt) -> Result<Arc<VMRegion>> {
        let size = object.size();
        let top_start = {
            let state = self.state.lock();
            let mut candidate = None;
            for id in state.iter_ids() {
                let node = state.get(id);
                if !node.used && node.size >= size {
                    candidate = Some(node.end() - size);
                }
            }
            candidate.ok_or(Error::NoMemory)?
        };

        self.map_object(object, prot, VirtualRange::new(top_start, size), 0)
    }

    /// Finishes a map after a record has been carved: builds the region,
    /// binds it into the record, and installs the hardware mapping. Rolls
    /// the record back to free if the hardware mapping fails.
    fn finish_map(
        self: &Arc<Self>,
        id: RegionId,
        object: VMObject,
        prot: VMProt,
        object_start: usize,
        size: usize,
    ) -> Result<Arc<VMRegion>> {
        let start = self.state.lock().get(id).start;
        let region = Arc::new(VMRegion::new(
            object,
            object_start,
            VirtualRange::new(start, size),
            prot,
            Arc::downgrade(self),
            id,
        ));

        self.state.lock().get_mut(id).region = Some(Arc::downgrade(&region));

        if let Err(e) = self.page_directory.map(&region) {
            warn!("map_object: page_directory.map failed, rolling back record");
            // The region never finished mapping, so there's nothing for
            // `Drop` to unmap; mark it torn down up front so dropping
            // `region` below doesn't repeat the `free_region` we're about
            // to do here.
            region.mark_torn_down();
            self.free_region(id);
            return Err(e);
        }
        trace!("map_object: mapped 0x{:x}..0x{:x}", start, start + size);
        Ok(region)
    }

    // -- unmapping ----------------------------------------------------

    /// Unmaps `region`. Equivalent to dropping the last `Arc<VMRegion>`,
    /// spelled out as an explicit call for callers that want the error
    /// return rather than a silent no-op on double free; a `region` that
    /// was already torn down (by a previous call here, or because every
    /// `Arc` referencing it has already been dropped) reports
    /// [`Error::NoSuch`] rather than repeating the teardown.
    pub fn unmap_region(&self, region: &VMRegion) -> Result<()> {
        if !region.mark_torn_down() {
            return Err(Error::NoSuch);
        }
        self.teardown_region(region.record, region);
        Ok(())
    }

    /// Unmaps whichever region's record starts exactly at `address`.
    pub fn unmap_region_at(&self, address: usize) -> Result<()> {
        let region = {
            let state = self.state.lock();
            let id = state
                .iter_ids()
                .find(|&id| state.get(id).start == address)
                .ok_or(Error::NoSuch)?;
            state
                .get(id)
                .region
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(Error::NoSuch)?
        };
        self.unmap_region(&region)
    }

    /// Tears a bound record down: removes the hardware mapping and frees
    /// the record. Called both from explicit unmap calls and from
    /// [`VMRegion`]'s `Drop`, so it must be safe to reach twice for the
    /// same id only through the latter (after an explicit unmap, the
    /// region's `Drop` finds the record already unbound and does nothing
    /// further because the `Weak` it would use to re-derive state is now
    /// meaningless — the record itself was already recycled).
    pub(crate) fn teardown_region(&self, id: RegionId, region: &VMRegion) {
        if let Err(e) = self.page_directory.unmap(region) {
            warn!("teardown_region: page_directory.unmap failed: {:?}", e);
        }
        self.free_region(id);
    }

    // -- lookup ----------------------------------------------------

    pub fn get_region_at(&self, addr: usize) -> Result<Arc<VMRegion>> {
        let state = self.state.lock();
        let id = state
            .iter_ids()
            .find(|&id| state.get(id).start == addr)
            .ok_or(Error::NoSuch)?;
        state
            .get(id)
            .region
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::NoSuch)
    }

    pub fn get_region_containing(&self, addr: usize) -> Result<Arc<VMRegion>> {
        let state = self.state.lock();
        let id = state
            .iter_ids()
            .find(|&id| state.get(id).contains(addr))
            .ok_or(Error::NoSuch)?;
        state
            .get(id)
            .region
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::NoSuch)
    }

    /// Marks `[start, start + size)` used with no bound region, to fence
    /// off addresses the kernel wants to keep free of ordinary mappings.
    pub fn reserve_region(&self, start: usize, size: usize) -> Result<()> {
        if !is_page_aligned(start) || !is_page_aligned(size) || size == 0 {
            return Err(Error::Invalid);
        }
        self.ensure_capacity(2);
        let mut state = self.state.lock();
        Self::carve_at(&mut state, size, start)?;
        Ok(())
    }

    /// The lowest-address free record's start, if it has room for `size`.
    pub fn find_free_space(&self, size: usize) -> Result<usize> {
        let state = self.state.lock();
        state
            .iter_ids()
            .map(|id| state.get(id))
            .find(|node| !node.used && node.size >= size)
            .map(|node| node.start)
            .ok_or(Error::NoMemory)
    }

    /// Sum of `object.size()` across used records whose object is
    /// anonymous and not shared. Used for memory accounting.
    pub fn calculate_regular_anonymous_total(&self) -> usize {
        let state = self.state.lock();
        state
            .iter_ids()
            .filter_map(|id| state.get(id).region.as_ref())
            .filter_map(Weak::upgrade)
            .filter_map(|region| region.object().as_anonymous().cloned())
            .filter(|anon| !anon.is_shared())
            .map(|anon| anon.size())
            .sum()
    }

    // -- fork ----------------------------------------------------

    /// Clones this space: a new `VMSpace` over the same window, with every
    /// record duplicated and every anonymous mapping re-resolved per its
    /// object's [`ForkAction`]. Newly created child regions are returned
    /// in `child_regions` — the caller (process-creation path) is this
    /// space's only strong owner of them until it registers them
    /// elsewhere, since the child's own records hold only `Weak` refs.
    pub fn fork(
        self: &Arc<Self>,
        child_page_directory: Arc<dyn PageDirectory>,
        child_regions: &mut Vec<Arc<VMRegion>>,
    ) -> Result<Arc<Self>> {
        // Snapshot the record list under the lock, then release it before
        // touching any collaborator (`page_directory.map` et al. must
        // never run with the arena lock held, per this type's own
        // locking discipline).
        struct Snapshot {
            start: usize,
            size: usize,
            used: bool,
            region: Option<Weak<VMRegion>>,
        }

        let (snapshot, used_total): (Vec<Snapshot>, usize) = {
            let src_state = self.state.lock();
            let snapshot = src_state
                .iter_ids()
                .map(|id| {
                    let node = src_state.get(id);
                    Snapshot {
                        start: node.start,
                        size: node.size,
                        used: node.used,
                        region: node.region.clone(),
                    }
                })
                .collect();
            (snapshot, src_state.used)
        };

        let child = Self::new(self.window.start, self.window.size, child_page_directory);

        // Build the child's record list with enough spare capacity for
        // every snapshotted entry, entirely before `child.state` is ever
        // locked: the placeholder record is recycled and the arena sized
        // up front, not grown while the lock below is held.
        let mut fresh_child_state =
            SpaceState::new_with_capacity(self.window.start, self.window.size, snapshot.len() + 1);
        fresh_child_state.used = used_total;
        fresh_child_state.head = None;
        fresh_child_state.recycle(RegionId(0));
        {
            let mut dst_state = child.state.lock();
            *dst_state = fresh_child_state;
        }

        let mut prev_child_id = None;
        for entry in &snapshot {
            let child_node_template = Node {
                start: entry.start,
                size: entry.size,
                used: entry.used,
                region: None,
                prev: prev_child_id,
                next: None,
            };

            let child_id = {
                let mut dst_state = child.state.lock();
                let id = dst_state
                    .insert(child_node_template)
                    .ok_or(Error::NoMemory)?;
                if let Some(p) = prev_child_id {
                    dst_state.get_mut(p).next = Some(id);
                } else {
                    dst_state.head = Some(id);
                }
                id
            };
            prev_child_id = Some(child_id);

            let Some(src_region) = entry.region.as_ref().and_then(Weak::upgrade) else {
                continue;
            };

            let object = src_region.object();
            let anon = object
                .as_anonymous()
                .expect("VMObject has no non-anonymous variant");

            match anon.fork_action() {
                ForkAction::BecomeCoW => {
                    let mut prot = src_region.prot();
                    if prot.contains(VMProt::WRITE) {
                        src_region.set_cow(true);
                        self.page_directory.map(&src_region)?;
                        prot.set_cow(true);
                    }
                    let child_region = Arc::new(VMRegion::new(
                        object,
                        src_region.object_start(),
                        src_region.range(),
                        prot,
                        Arc::downgrade(&child),
                        child_id,
                    ));
                    child.page_directory.map(&child_region)?;
                    child.state.lock().get_mut(child_id).region =
                        Some(Arc::downgrade(&child_region));
                    child_regions.push(child_region);
                }
                ForkAction::Share => {
                    let child_region = Arc::new(VMRegion::new(
                        object,
                        src_region.object_start(),
                        src_region.range(),
                        src_region.prot(),
                        Arc::downgrade(&child),
                        child_id,
                    ));
                    child.page_directory.map(&child_region)?;
                    child.state.lock().get_mut(child_id).region =
                        Some(Arc::downgrade(&child_region));
                    child_regions.push(child_region);
                }
                ForkAction::Ignore => {
                    debug!("fork: dropping Ignore-policy mapping in child");
                }
            }
        }

        Ok(child)
    }

    // -- page faults ----------------------------------------------------

    /// Services a page fault at `addr`: breaks copy-on-write if `addr`
    /// falls in a CoW anonymous region, otherwise reports the fault as
    /// illegal. The space lock is held only to look the record up; the
    /// allocation and copy that follow run unlocked.
    pub fn try_pagefault(self: &Arc<Self>, addr: usize, mm: &dyn MemoryManager) -> Result<()> {
        let region = {
            let state = self.state.lock();
            let id = state
                .iter_ids()
                .find(|&id| state.get(id).contains(addr))
                .ok_or(Error::NoSuch)?;
            state
                .get(id)
                .region
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(Error::Invalid)?
        };

        let old_object = region.object();
        if !region.is_cow() || !old_object.is_anonymous() {
            return Err(Error::Invalid);
        }
        let old_anon = old_object.as_anonymous().unwrap().clone();

        let new_anon = crate::object::AnonymousVMObject::alloc(old_anon.size(), mm)?;
        {
            let mut new_view = mm.map_for_kernel(&new_anon)?;
            let mut old_view = mm.map_for_kernel(&old_anon)?;
            new_view.as_mut_slice().copy_from_slice(old_view.as_mut_slice());
        }

        region.rebind(VMObject::Anonymous(new_anon));
        self.page_directory.map(&region)?;
        debug!("try_pagefault: broke CoW at 0x{:x}", addr);
        Ok(())
    }

    // -- low-level record carving ----------------------------------------------------

    /// First-fit: claims the lowest-address free record of at least
    /// `size` bytes, splitting off its head if it's larger than needed.
    fn carve_any(state: &mut SpaceState, size: usize) -> Result<RegionId> {
        let free_id = state
            .iter_ids()
            .find(|&id| {
                let node = state.get(id);
                !node.used && node.size >= size
            })
            .ok_or(Error::NoMemory)?;

        let free = state.get(free_id);
        if free.size == size {
            state.get_mut(free_id).used = true;
            state.used += size;
            return Ok(free_id);
        }

        let old_prev = free.prev;
        let used_node = Node {
            start: free.start,
            size,
            used: true,
            region: None,
            prev: old_prev,
            next: Some(free_id),
        };
        let used_id = state.insert(used_node).ok_or(Error::NoMemory)?;

        let free = state.get_mut(free_id);
        free.start += size;
        free.size -= size;
        free.prev = Some(used_id);

        if let Some(p) = old_prev {
            state.get_mut(p).next = Some(used_id);
        } else {
            state.head = Some(used_id);
        }
        state.used += size;
        Ok(used_id)
    }

    /// Claims `[address, address + size)`, which must fall entirely
    /// inside one free record, splitting off a free head and/or tail as
    /// needed.
    fn carve_at(state: &mut SpaceState, size: usize, address: usize) -> Result<RegionId> {
        let id = state
            .iter_ids()
            .find(|&id| state.get(id).contains(address))
            .ok_or(Error::NoMemory)?;

        let (node_start, node_size, node_used, old_prev, old_next) = {
            let node = state.get(id);
            (node.start, node.size, node.used, node.prev, node.next)
        };

        if node_used || node_start + node_size < address + size {
            return Err(Error::NoMemory);
        }

        let head_size = address - node_start;
        let tail_start = address + size;
        let tail_size = (node_start + node_size) - tail_start;

        if head_size > 0 {
            let head_id = state
                .insert(Node {
                    start: node_start,
                    size: head_size,
                    used: false,
                    region: None,
                    prev: old_prev,
                    next: Some(id),
                })
                .ok_or(Error::NoMemory)?;
            if let Some(p) = old_prev {
                state.get_mut(p).next = Some(head_id);
            } else {
                state.head = Some(head_id);
            }
            state.get_mut(id).prev = Some(head_id);
        }

        if tail_size > 0 {
            let tail_id = state
                .insert(Node {
                    start: tail_start,
                    size: tail_size,
                    used: false,
                    region: None,
                    prev: Some(id),
                    next: old_next,
                })
                .ok_or(Error::NoMemory)?;
            if let Some(n) = old_next {
                state.get_mut(n).prev = Some(tail_id);
            }
            state.get_mut(id).next = Some(tail_id);
        }

        let node = state.get_mut(id);
        node.start = address;
        node.size = size;
        node.used = true;
        node.region = None;
        state.used += size;
        Ok(id)
    }

    /// Frees `id`'s record, coalescing with an adjacent free predecessor
    /// and/or successor.
    fn free_region(&self, id: RegionId) {
        let mut state = self.state.lock();
        {
            let node = state.get_mut(id);
            node.used = false;
            node.region = None;
        }
        state.used -= state.get(id).size;

        if let Some(prev_id) = state.get(id).prev {
            if !state.get(prev_id).used {
                let (prev_start, prev_size, prev_prev) = {
                    let p = state.get(prev_id);
                    (p.start, p.size, p.prev)
                };
                let node = state.get_mut(id);
                node.start = prev_start;
                node.size += prev_size;
                node.prev = prev_prev;
                if let Some(pp) = prev_prev {
                    state.get_mut(pp).next = Some(id);
                } else {
                    state.head = Some(id);
                }
                state.recycle(prev_id);
            }
        }

        if let Some(next_id) = state.get(id).next {
            if !state.get(next_id).used {
                let (next_size, next_next) = {
                    let n = state.get(next_id);
                    (n.size, n.next)
                };
                let node = state.get_mut(id);
                node.size += next_size;
                node.next = next_next;
                if let Some(nn) = next_next {
                    state.get_mut(nn).prev = Some(id);
                }
                state.recycle(next_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::VMSpace;
    use crate::error::Error;
    use crate::object::{AnonymousVMObject, VMObject};
    use crate::prot::{VMProt, VirtualRange, PAGE_SIZE};
    use crate::testing::{FailingPageDirectory, MockMemoryManager, MockPageDirectory};

    const WINDOW: usize = 0x1000_0000;
    const WINDOW_SIZE: usize = 16 * PAGE_SIZE;

    fn new_space() -> Arc<VMSpace> {
        VMSpace::new(WINDOW, WINDOW_SIZE, MockPageDirectory::new())
    }

    #[test]
    fn exact_fit_consumes_the_whole_free_record() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc(WINDOW_SIZE, &mm).unwrap();

        let region = space
            .map_object(
                VMObject::Anonymous(object),
                VMProt::rwx(),
                VirtualRange::new(0, 0),
                0,
            )
            .unwrap();

        assert_eq!(region.start(), WINDOW);
        assert_eq!(region.size(), WINDOW_SIZE);
        assert_eq!(space.used(), WINDOW_SIZE);
        assert!(space.find_free_space(PAGE_SIZE).is_err());
    }

    #[test]
    fn carving_a_middle_chunk_splits_into_three_records() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc(4 * PAGE_SIZE, &mm).unwrap();

        let region = space
            .map_object(
                VMObject::Anonymous(object),
                VMProt::rwx(),
                VirtualRange::new(WINDOW + 4 * PAGE_SIZE, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();

        assert_eq!(region.start(), WINDOW + 4 * PAGE_SIZE);
        assert_eq!(space.used(), 4 * PAGE_SIZE);
        // Both the head (4 pages) and tail (8 pages) remain free and
        // individually addressable.
        assert_eq!(space.find_free_space(4 * PAGE_SIZE).unwrap(), WINDOW);
        let region2 = space
            .map_object(
                VMObject::Anonymous(AnonymousVMObject::alloc(8 * PAGE_SIZE, &mm).unwrap()),
                VMProt::rwx(),
                VirtualRange::new(WINDOW + 8 * PAGE_SIZE, 8 * PAGE_SIZE),
                0,
            )
            .unwrap();
        assert_eq!(region2.start(), WINDOW + 8 * PAGE_SIZE);
    }

    #[test]
    fn freeing_coalesces_with_both_neighbors() {
        let space = new_space();
        let mm = MockMemoryManager::new();

        let make = |size| {
            VMObject::Anonymous(AnonymousVMObject::alloc(size, &mm).unwrap())
        };

        let left = space
            .map_object(make(4 * PAGE_SIZE), VMProt::rwx(), VirtualRange::new(WINDOW, 4 * PAGE_SIZE), 0)
            .unwrap();
        let mid = space
            .map_object(
                make(4 * PAGE_SIZE),
                VMProt::rwx(),
                VirtualRange::new(WINDOW + 4 * PAGE_SIZE, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();
        let right = space
            .map_object(
                make(4 * PAGE_SIZE),
                VMProt::rwx(),
                VirtualRange::new(WINDOW + 8 * PAGE_SIZE, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();

        drop(left);
        drop(right);
        assert_eq!(space.used(), 4 * PAGE_SIZE);

        drop(mid);
        assert_eq!(space.used(), 0);
        // The entire window should be free and contiguous again.
        assert_eq!(space.find_free_space(WINDOW_SIZE).unwrap(), WINDOW);
    }

    #[test]
    fn map_stack_lands_at_the_top_of_the_window() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc(2 * PAGE_SIZE, &mm).unwrap();

        let region = space
            .map_stack(VMObject::Anonymous(object), VMProt::rwx())
            .unwrap();

        assert_eq!(region.end(), WINDOW + WINDOW_SIZE);
        assert_eq!(region.start(), WINDOW + WINDOW_SIZE - 2 * PAGE_SIZE);
    }

    #[test]
    fn map_object_rejects_unaligned_and_oversized_requests() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = VMObject::Anonymous(AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap());

        assert_eq!(
            space
                .map_object(object.clone(), VMProt::rwx(), VirtualRange::new(1, PAGE_SIZE), 0)
                .unwrap_err(),
            Error::Invalid
        );
        assert_eq!(
            space
                .map_object(object, VMProt::rwx(), VirtualRange::new(0, 0), PAGE_SIZE)
                .unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn map_object_fails_on_overlap_with_used_record() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let _first = space
            .map_object(
                VMObject::Anonymous(AnonymousVMObject::alloc(4 * PAGE_SIZE, &mm).unwrap()),
                VMProt::rwx(),
                VirtualRange::new(WINDOW, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();

        let err = space
            .map_object(
                VMObject::Anonymous(AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap()),
                VMProt::rwx(),
                VirtualRange::new(WINDOW + PAGE_SIZE, PAGE_SIZE),
                0,
            )
            .unwrap_err();
        assert_eq!(err, Error::NoMemory);
    }

    #[test]
    fn map_object_rolls_back_record_on_hardware_failure() {
        let space = VMSpace::new(WINDOW, WINDOW_SIZE, Arc::new(FailingPageDirectory));
        let mm = MockMemoryManager::new();
        let object = VMObject::Anonymous(AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap());

        let err = space
            .map_object(object, VMProt::rwx(), VirtualRange::new(0, 0), 0)
            .unwrap_err();
        assert_eq!(err, Error::NoMemory);
        assert_eq!(space.used(), 0);
        assert_eq!(space.find_free_space(WINDOW_SIZE).unwrap(), WINDOW);
    }

    #[test]
    fn fork_shares_cow_and_pagefault_gives_child_a_private_copy() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap();

        {
            let mut view = mm.map_for_kernel(&object).unwrap();
            view.as_mut_slice()[0] = 0xAB;
        }

        let parent_region = space
            .map_object(
                VMObject::Anonymous(object),
                VMProt::rwx(),
                VirtualRange::new(0, 0),
                0,
            )
            .unwrap();
        assert!(!parent_region.is_cow());

        let mut child_regions = Vec::new();
        let child = space
            .fork(MockPageDirectory::new(), &mut child_regions)
            .unwrap();

        // Forking a writable private mapping flips both sides to CoW.
        assert!(parent_region.is_cow());
        assert_eq!(child_regions.len(), 1);
        let child_region = child_regions[0].clone();
        assert!(child_region.is_cow());

        child.try_pagefault(child_region.start(), &mm).unwrap();
        assert!(!child_region.is_cow());

        // The child's freshly broken-CoW object must carry the parent's
        // data at the moment of the fault.
        let child_anon = child_region.object().as_anonymous().unwrap().clone();
        let mut view = mm.map_for_kernel(&child_anon).unwrap();
        assert_eq!(view.as_mut_slice()[0], 0xAB);

        // And it must be a distinct object: writing through the child no
        // longer touches the parent's frame.
        view.as_mut_slice()[0] = 0xCD;
        drop(view);
        let parent_anon = parent_region.object().as_anonymous().unwrap().clone();
        let mut parent_view = mm.map_for_kernel(&parent_anon).unwrap();
        assert_eq!(parent_view.as_mut_slice()[0], 0xAB);
    }

    #[test]
    fn fork_share_maps_the_same_object_writable_in_both() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc_shared(PAGE_SIZE, &mm).unwrap();

        let parent_region = space
            .map_object(
                VMObject::Anonymous(object),
                VMProt::rwx(),
                VirtualRange::new(0, 0),
                0,
            )
            .unwrap();
        assert!(!parent_region.is_cow());

        let mut child_regions = Vec::new();
        let _child = space
            .fork(MockPageDirectory::new(), &mut child_regions)
            .unwrap();

        // Share never flips either side to copy-on-write.
        assert!(!parent_region.is_cow());
        assert_eq!(child_regions.len(), 1);
        let child_region = child_regions[0].clone();
        assert!(!child_region.is_cow());
        assert!(child_region.prot().contains(VMProt::WRITE));

        // A write through the parent's frame is visible through the
        // child's mapping, since both map the very same object.
        let parent_anon = parent_region.object().as_anonymous().unwrap().clone();
        {
            let mut view = mm.map_for_kernel(&parent_anon).unwrap();
            view.as_mut_slice()[0] = 0x42;
        }
        let child_anon = child_region.object().as_anonymous().unwrap().clone();
        let mut view = mm.map_for_kernel(&child_anon).unwrap();
        assert_eq!(view.as_mut_slice()[0], 0x42);
    }

    #[test]
    fn fork_ignore_drops_the_mapping_in_the_child() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = AnonymousVMObject::alloc_ignored(PAGE_SIZE, &mm).unwrap();

        let parent_region = space
            .map_object(
                VMObject::Anonymous(object),
                VMProt::rwx(),
                VirtualRange::new(0, 0),
                0,
            )
            .unwrap();

        let mut child_regions = Vec::new();
        let child = space
            .fork(MockPageDirectory::new(), &mut child_regions)
            .unwrap();

        assert!(child_regions.is_empty());
        assert_eq!(
            child.get_region_at(parent_region.start()).unwrap_err(),
            Error::NoSuch
        );
    }

    #[test]
    fn reserve_region_marks_a_range_used_without_binding_a_region() {
        let space = new_space();

        space.reserve_region(WINDOW, 4 * PAGE_SIZE).unwrap();

        assert_eq!(space.used(), 4 * PAGE_SIZE);
        assert_eq!(space.get_region_at(WINDOW).unwrap_err(), Error::NoSuch);
        assert_eq!(
            space.find_free_space(WINDOW_SIZE).unwrap_err(),
            Error::NoMemory
        );
        assert_eq!(
            space.find_free_space(WINDOW_SIZE - 4 * PAGE_SIZE).unwrap(),
            WINDOW + 4 * PAGE_SIZE
        );
    }

    #[test]
    fn get_region_at_and_containing_resolve_a_mapped_region() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = VMObject::Anonymous(AnonymousVMObject::alloc(4 * PAGE_SIZE, &mm).unwrap());

        let region = space
            .map_object(
                object,
                VMProt::rwx(),
                VirtualRange::new(WINDOW, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();

        let found = space.get_region_at(WINDOW).unwrap();
        assert!(Arc::ptr_eq(&found, &region));

        let found = space.get_region_containing(WINDOW + PAGE_SIZE).unwrap();
        assert!(Arc::ptr_eq(&found, &region));

        assert_eq!(
            space.get_region_at(WINDOW + PAGE_SIZE).unwrap_err(),
            Error::NoSuch
        );
        assert_eq!(
            space
                .get_region_containing(WINDOW + 4 * PAGE_SIZE)
                .unwrap_err(),
            Error::NoSuch
        );
    }

    #[test]
    fn unmap_region_at_tears_down_the_mapping_and_frees_the_record() {
        let space = new_space();
        let mm = MockMemoryManager::new();
        let object = VMObject::Anonymous(AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap());

        let region = space
            .map_object(object, VMProt::rwx(), VirtualRange::new(WINDOW, PAGE_SIZE), 0)
            .unwrap();

        space.unmap_region_at(WINDOW).unwrap();

        assert_eq!(space.used(), 0);
        assert_eq!(space.find_free_space(WINDOW_SIZE).unwrap(), WINDOW);
        assert_eq!(space.unmap_region_at(WINDOW).unwrap_err(), Error::NoSuch);

        // `region`'s own `Drop` must see the record already torn down and
        // not repeat the teardown.
        drop(region);
        assert_eq!(space.used(), 0);
    }

    #[test]
    fn calculate_regular_anonymous_total_counts_only_private_anonymous_mappings() {
        let space = new_space();
        let mm = MockMemoryManager::new();

        let private = VMObject::Anonymous(AnonymousVMObject::alloc(4 * PAGE_SIZE, &mm).unwrap());
        let shared =
            VMObject::Anonymous(AnonymousVMObject::alloc_shared(2 * PAGE_SIZE, &mm).unwrap());

        let _private_region = space
            .map_object(
                private,
                VMProt::rwx(),
                VirtualRange::new(WINDOW, 4 * PAGE_SIZE),
                0,
            )
            .unwrap();
        let _shared_region = space
            .map_object(
                shared,
                VMProt::rwx(),
                VirtualRange::new(WINDOW + 4 * PAGE_SIZE, 2 * PAGE_SIZE),
                0,
            )
            .unwrap();

        assert_eq!(space.calculate_regular_anonymous_total(), 4 * PAGE_SIZE);
    }

    #[test]
    fn mapping_many_records_never_needs_manual_capacity_growth() {
        // Exercises `ensure_capacity`'s growth path: more records than the
        // arena's initial capacity, each carved from the tail of the
        // previous free record.
        let space = VMSpace::new(WINDOW, 64 * PAGE_SIZE, MockPageDirectory::new());
        let mm = MockMemoryManager::new();
        let mut regions = Vec::new();

        for i in 0..32 {
            let object = VMObject::Anonymous(AnonymousVMObject::alloc(PAGE_SIZE, &mm).unwrap());
            let region = space
                .map_object(
                    object,
                    VMProt::rwx(),
                    VirtualRange::new(WINDOW + i * PAGE_SIZE, PAGE_SIZE),
                    0,
                )
                .unwrap();
            regions.push(region);
        }

        assert_eq!(space.used(), 32 * PAGE_SIZE);
        for (i, region) in regions.iter().enumerate() {
            assert_eq!(region.start(), WINDOW + i * PAGE_SIZE);
        }
    }
}
