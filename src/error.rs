// SPDX-License-Identifier: MPL-2.0

pub type Result<T> = core::result::Result<T, self::Error>;

/// Errors returned by the virtual memory subsystem.
///
/// Invariant violations (unknown object kind during fork, double-free of
/// a space record, ...) are not represented here: they are fatal and are
/// reported as Rust panics, per the failure model in the subsystem spec.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// An argument violated a precondition: misaligned address/size,
    /// an out-of-bounds object range, or a fault on a non-CoW region.
    Invalid,
    /// No free space record was large enough, or the physical/object
    /// allocator it depends on is exhausted.
    NoMemory,
    /// The addressed region or record does not exist.
    NoSuch,
}
