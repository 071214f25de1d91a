// SPDX-License-Identifier: MPL-2.0

//! The region-record list backing a [`VMSpace`](super::VMSpace), as an
//! arena of [`Node`]s addressed by [`RegionId`].
//!
//! An intrusive doubly-linked list of `new`/`delete`d nodes becomes a
//! `Vec` of slots plus a free-list of reusable indices, with `prev`/`next`
//! as `Option<RegionId>`. Coverage, sortedness and coalescing are exactly
//! the same list-of-ranges invariants; only the storage changed.

use alloc::sync::Weak;
use alloc::vec::Vec;

use crate::region::VMRegion;

/// An index into a [`SpaceState`]'s node arena. Stable for as long as the
/// node it names stays linked into the list; never reused while still
/// reachable from `head`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegionId(pub(super) usize);

pub(super) struct Node {
    pub start: usize,
    pub size: usize,
    pub used: bool,
    pub region: Option<Weak<VMRegion>>,
    pub prev: Option<RegionId>,
    pub next: Option<RegionId>,
}

impl Node {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// The mutable state guarded by a [`VMSpace`]'s lock: the node arena, the
/// head of the list it encodes, and the running used-bytes total.
pub(super) struct SpaceState {
    nodes: Vec<Node>,
    free_ids: Vec<RegionId>,
    pub head: Option<RegionId>,
    pub used: usize,
}

impl SpaceState {
    /// A fresh state with the entire window as one free record and room
    /// for `capacity` total records before either backing `Vec` needs to
    /// grow.
    pub fn new_with_capacity(start: usize, size: usize, capacity: usize) -> Self {
        let node = Node {
            start,
            size,
            used: false,
            region: None,
            prev: None,
            next: None,
        };
        let capacity = capacity.max(1);
        let mut nodes = Vec::with_capacity(capacity);
        nodes.push(node);
        Self {
            nodes,
            free_ids: Vec::with_capacity(capacity),
            head: Some(RegionId(0)),
            used: 0,
        }
    }

    /// A fresh state with the entire window as one free record.
    pub fn new(start: usize, size: usize) -> Self {
        Self::new_with_capacity(start, size, 1)
    }

    pub fn get(&self, id: RegionId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: RegionId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Records immediately available to `insert` without growing either
    /// backing `Vec`.
    pub fn spare_capacity(&self) -> usize {
        self.free_ids.len() + (self.nodes.capacity() - self.nodes.len())
    }

    /// Swaps in backing storage built outside any lock, moving the
    /// existing nodes and free ids into it. `grown_nodes`/`grown_free_ids`
    /// must already carry enough capacity for the existing contents plus
    /// whatever headroom the caller reserved; absorbing them here is a
    /// move, not an allocation.
    pub fn absorb_growth(&mut self, mut grown_nodes: Vec<Node>, mut grown_free_ids: Vec<RegionId>) {
        grown_nodes.append(&mut self.nodes);
        self.nodes = grown_nodes;
        grown_free_ids.append(&mut self.free_ids);
        self.free_ids = grown_free_ids;
    }

    /// Stores `node` in a fresh or recycled slot and returns its id, or
    /// `None` if the arena has no spare capacity — callers are expected to
    /// have reserved enough headroom before taking the lock this is called
    /// under, so this never needs to allocate itself.
    pub fn insert(&mut self, node: Node) -> Option<RegionId> {
        if let Some(id) = self.free_ids.pop() {
            self.nodes[id.0] = node;
            Some(id)
        } else if self.nodes.len() < self.nodes.capacity() {
            let id = RegionId(self.nodes.len());
            self.nodes.push(node);
            Some(id)
        } else {
            None
        }
    }

    /// Marks `id`'s slot available for reuse. The node must already be
    /// unlinked from the list (no remaining `prev`/`next` pointing at it).
    /// Never allocates: `free_ids` is kept at capacity parity with `nodes`
    /// (see `absorb_growth`/`new_with_capacity`), and `free_ids.len()` can
    /// never exceed `nodes.len()`.
    pub fn recycle(&mut self, id: RegionId) {
        self.free_ids.push(id);
    }

    /// An iterator over node ids in ascending-address (list) order.
    pub fn iter_ids(&self) -> IdIter<'_> {
        IdIter {
            state: self,
            next: self.head,
        }
    }
}

pub(super) struct IdIter<'a> {
    state: &'a SpaceState,
    next: Option<RegionId>,
}

impl Iterator for IdIter<'_> {
    type Item = RegionId;

    fn next(&mut self) -> Option<RegionId> {
        let cur = self.next?;
        self.next = self.state.get(cur).next;
        Some(cur)
    }
}
