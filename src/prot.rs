// SPDX-License-Identifier: MPL-2.0

//! Page size, alignment helpers, protection flags and virtual ranges.

use align_ext::AlignExt;
use bitflags::bitflags;

use crate::error::{Error, Result};

/// The fixed page size this subsystem operates in. A multiple of it is
/// required for every size and offset the subsystem deals with.
pub const PAGE_SIZE: usize = 4096;

/// Returns whether `value` is a multiple of [`PAGE_SIZE`].
#[inline]
pub fn is_page_aligned(value: usize) -> bool {
    value % PAGE_SIZE == 0
}

/// Rounds `value` up to the next multiple of [`PAGE_SIZE`].
#[inline]
pub fn page_align_up(value: usize) -> usize {
    value.align_up(PAGE_SIZE)
}

bitflags! {
    /// The protection descriptor of a [`VMRegion`](crate::region::VMRegion).
    ///
    /// `COW` is folded into the protection set rather than tracked as a
    /// separate boolean: a CoW region reads like any other readable
    /// mapping and only differs in whether writes are actually let
    /// through to hardware.
    pub struct VMProt: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXECUTE = 0b0100;
        const COW     = 0b1000;
    }
}

impl VMProt {
    /// All access rights, not copy-on-write. The default for a fresh
    /// private mapping.
    pub const fn rwx() -> Self {
        Self::from_bits_truncate(Self::READ.bits | Self::WRITE.bits | Self::EXECUTE.bits)
    }

    pub fn is_cow(&self) -> bool {
        self.contains(Self::COW)
    }

    pub fn set_cow(&mut self, cow: bool) {
        self.set(Self::COW, cow);
    }

    /// The permissions a [`PageDirectory`](crate::collab::PageDirectory)
    /// should actually install: copy-on-write forces the hardware mapping
    /// read-only even if `WRITE` is set, so that the first write traps.
    pub fn effective(&self) -> Self {
        let mut eff = *self;
        if eff.is_cow() {
            eff.remove(Self::WRITE);
        }
        eff
    }
}

impl Default for VMProt {
    fn default() -> Self {
        Self::rwx()
    }
}

/// A page-aligned range of virtual addresses.
///
/// `size == 0` is a sentinel meaning "until the end of the mapped object",
/// resolved by [`VMSpace::map_object`](crate::space::VMSpace::map_object)
/// before any allocation happens.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VirtualRange {
    pub start: usize,
    pub size: usize,
}

impl VirtualRange {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Validates that `start` (if nonzero) and `size` are page-aligned.
    /// `start == 0` is the "any free location" sentinel and is exempt.
    pub(crate) fn check_alignment(&self) -> Result<()> {
        if (self.start != 0 && !is_page_aligned(self.start)) || !is_page_aligned(self.size) {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_up_rounds_to_next_page() {
        assert_eq!(page_align_up(0), 0);
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn cow_forces_effective_read_only() {
        let mut prot = VMProt::rwx();
        assert!(!prot.is_cow());
        prot.set_cow(true);
        assert!(prot.is_cow());
        assert!(prot.contains(VMProt::WRITE));
        assert!(!prot.effective().contains(VMProt::WRITE));
        assert!(prot.effective().contains(VMProt::READ));
    }

    #[test]
    fn virtual_range_alignment() {
        assert!(VirtualRange::new(0, PAGE_SIZE).check_alignment().is_ok());
        assert!(VirtualRange::new(PAGE_SIZE, PAGE_SIZE)
            .check_alignment()
            .is_ok());
        assert!(VirtualRange::new(1, PAGE_SIZE).check_alignment().is_err());
        assert!(VirtualRange::new(PAGE_SIZE, 1).check_alignment().is_err());
    }

    #[test]
    fn virtual_range_contains() {
        let range = VirtualRange::new(PAGE_SIZE, PAGE_SIZE * 2);
        assert!(!range.contains(PAGE_SIZE - 1));
        assert!(range.contains(PAGE_SIZE));
        assert!(range.contains(PAGE_SIZE * 2));
        assert!(!range.contains(PAGE_SIZE * 3));
    }
}
