// SPDX-License-Identifier: MPL-2.0

//! Mock collaborators standing in for the hardware page-table layer and
//! physical-frame allocator in tests. There is no booted kernel to run
//! against here, so these replace the `#[ktest]` harness the rest of the
//! tree this subsystem ships in normally uses for hardware-touching code.

use std::sync::Mutex as StdMutex;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::collab::{Frame, KernelView, MemoryManager, PageDirectory};
use crate::error::{Error, Result};
use crate::object::AnonymousVMObject;
use crate::prot::PAGE_SIZE;
use crate::region::VMRegion;

/// A flat array of zeroed pages standing in for physical RAM.
pub(crate) struct MockMemoryManager {
    store: Arc<StdMutex<Vec<[u8; PAGE_SIZE]>>>,
}

impl MockMemoryManager {
    pub fn new() -> Self {
        Self {
            store: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

impl MemoryManager for MockMemoryManager {
    fn alloc_frames(&self, count: usize) -> Result<Vec<Frame>> {
        let mut store = self.store.lock().unwrap();
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let id = store.len();
            store.push([0u8; PAGE_SIZE]);
            frames.push(Frame(id));
        }
        Ok(frames)
    }

    fn map_for_kernel(&self, object: &Arc<AnonymousVMObject>) -> Result<Box<dyn KernelView>> {
        let frame_ids: Vec<usize> = object.frames().iter().map(|f| f.0).collect();
        Ok(Box::new(MockKernelView::new(self.store.clone(), frame_ids)))
    }
}

/// A kernel-mapped view of a set of frames: reads the current page
/// contents in on construction, writes the buffer back out on drop, the
/// way an actual transient kernel mapping would flush to physical memory
/// when unmapped.
struct MockKernelView {
    store: Arc<StdMutex<Vec<[u8; PAGE_SIZE]>>>,
    frame_ids: Vec<usize>,
    buf: Vec<u8>,
}

impl MockKernelView {
    fn new(store: Arc<StdMutex<Vec<[u8; PAGE_SIZE]>>>, frame_ids: Vec<usize>) -> Self {
        let buf = {
            let guard = store.lock().unwrap();
            frame_ids.iter().flat_map(|&id| guard[id]).collect()
        };
        Self {
            store,
            frame_ids,
            buf,
        }
    }
}

impl KernelView for MockKernelView {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MockKernelView {
    fn drop(&mut self) {
        let mut guard = self.store.lock().unwrap();
        for (i, &id) in self.frame_ids.iter().enumerate() {
            guard[id].copy_from_slice(&self.buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
        }
    }
}

/// Records every range it's asked to map, and always succeeds.
pub(crate) struct MockPageDirectory {
    pub mapped: StdMutex<Vec<(usize, usize)>>,
}

impl MockPageDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mapped: StdMutex::new(Vec::new()),
        })
    }
}

impl PageDirectory for MockPageDirectory {
    fn map(&self, region: &VMRegion) -> Result<()> {
        self.mapped.lock().unwrap().push((region.start(), region.size()));
        Ok(())
    }

    fn unmap(&self, _region: &VMRegion) -> Result<()> {
        Ok(())
    }
}

/// Fails every `map` call, for exercising rollback paths.
pub(crate) struct FailingPageDirectory;

impl PageDirectory for FailingPageDirectory {
    fn map(&self, _region: &VMRegion) -> Result<()> {
        Err(Error::NoMemory)
    }

    fn unmap(&self, _region: &VMRegion) -> Result<()> {
        Ok(())
    }
}
