// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

//! Logic for checking process memory accesses, factored out of the kernel so
//! it can be exercised with plain `cargo test`.
//!
//! The kernel must decide, for every pointer a process hands it, whether the
//! process could have touched that memory itself. The process's authority is
//! described by a short table of MPU regions; the candidate access is a
//! base/length pair. Nothing here dereferences anything -- this is pure
//! address arithmetic.

/// Describes types that act as "slices" (in the very abstract sense)
/// referenced by processes in syscalls.
///
/// This is not the same thing as a Rust slice in the kernel, because this is
/// just a base-length pair --- taken by itself, it doesn't let you actually
/// _access_ the memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes. Empty slices are opted out
    /// of access checking to allow process code to use literals like `&[]`.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past the
    /// end.
    ///
    /// Note that this prevents a slice from touching the end of the address
    /// space. This is also prevented, in practice, by the definition of
    /// several Rust core types, so we accept it.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that delimit a region of the address space a process may
/// have rights to.
///
/// Region *attributes* deliberately don't appear here; the caller supplies a
/// predicate over its region type when they matter.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice
/// versa.
///
/// By extension, `r.base_addr() <= r.end_addr()` must hold.
pub trait MemoryRegion {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Checks whether an access to `slice` is covered by the regions in `table`,
/// considering only regions accepted by `region_ok`.
///
/// The slice may span several regions, but the spanned regions must be
/// perfectly contiguous: the MPU enforces exactly this, and the kernel must
/// not be more permissive than the hardware would be for the process's own
/// accesses.
///
/// # Preconditions
///
/// `table` must be sorted by region base address, and the regions in the
/// table must not overlap. (The process builder enforces this when the
/// region set is configured.)
///
/// # Returns
///
/// `true` if `slice` is completely covered by one or more contiguous regions
/// in `table` that meet the `region_ok` condition; `false` otherwise.
pub fn can_access<S, R>(
    slice: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    S: UserSlice,
    R: MemoryRegion,
{
    if slice.is_empty() {
        // Empty slices confer no authority, so we accept them all. This is
        // important because a literal like `&[]` tends to produce a base
        // address of `0 + sizeof::<T>()`, which is almost certainly not in
        // any region... but fine with us.
        return true;
    }

    let end_addr = slice.end_addr();

    // `covered` advances through the slice as we match regions; the slice is
    // acceptable once it reaches `end_addr`. Because the table is sorted and
    // non-overlapping, a single forward pass suffices.
    let mut covered = slice.base_addr();

    for region in table {
        if region.base_addr() > covered {
            // There is a hole between what we've covered so far and this
            // region (or the slice starts in no region at all). Since later
            // regions are even higher, no region can fill it.
            return false;
        }
        if !region.contains(covered) {
            // Region entirely below the point we care about; keep scanning.
            continue;
        }
        if !region_ok(region) {
            // The region covering the next byte lacks the required
            // attributes.
            return false;
        }
        covered = region.end_addr();
        if covered >= end_addr {
            return true;
        }
    }

    // Ran off the end of the table with part of the slice uncovered.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSlice {
        base: usize,
        size: usize,
    }

    impl UserSlice for TestSlice {
        fn is_empty(&self) -> bool {
            self.size == 0
        }

        fn base_addr(&self) -> usize {
            self.base
        }

        fn end_addr(&self) -> usize {
            self.base + self.size
        }
    }

    struct TestRegion {
        base: usize,
        size: usize,
        writable: bool,
    }

    impl MemoryRegion for TestRegion {
        fn contains(&self, addr: usize) -> bool {
            addr >= self.base && addr < self.end_addr()
        }

        fn base_addr(&self) -> usize {
            self.base
        }

        fn end_addr(&self) -> usize {
            self.base + self.size
        }
    }

    // Region tables in these tests mimic a real process layout: power-of-two
    // sized, size-aligned regions, sorted by base, some adjacent and some
    // with holes between them.
    fn process_regions() -> Vec<TestRegion> {
        vec![
            // Flash image, read-only.
            TestRegion {
                base: 0x0800_0000,
                size: 0x0002_0000,
                writable: false,
            },
            // RAM image, two adjacent regions.
            TestRegion {
                base: 0x2000_0000,
                size: 0x0000_4000,
                writable: true,
            },
            TestRegion {
                base: 0x2000_4000,
                size: 0x0000_4000,
                writable: true,
            },
            // A second RAM region, separated from the first by a hole.
            TestRegion {
                base: 0x2001_0000,
                size: 0x0000_1000,
                writable: true,
            },
        ]
    }

    fn any(_: &TestRegion) -> bool {
        true
    }

    fn writable(r: &TestRegion) -> bool {
        r.writable
    }

    #[test]
    fn empty_slice_is_always_ok() {
        assert!(can_access(
            TestSlice { base: 4, size: 0 },
            &process_regions(),
            any,
        ));
    }

    #[test]
    fn access_within_single_region() {
        let table = process_regions();
        assert!(can_access(
            TestSlice {
                base: 0x2000_0100,
                size: 0x200,
            },
            &table,
            writable,
        ));
    }

    #[test]
    fn write_to_read_only_region_rejected() {
        let table = process_regions();
        assert!(!can_access(
            TestSlice {
                base: 0x0800_0100,
                size: 4,
            },
            &table,
            writable,
        ));
        // The same slice is fine if we only need it to exist.
        assert!(can_access(
            TestSlice {
                base: 0x0800_0100,
                size: 4,
            },
            &table,
            any,
        ));
    }

    #[test]
    fn access_spanning_adjacent_regions() {
        let table = process_regions();
        assert!(can_access(
            TestSlice {
                base: 0x2000_3F00,
                size: 0x200,
            },
            &table,
            writable,
        ));
    }

    #[test]
    fn access_spanning_hole_rejected() {
        let table = process_regions();
        // Starts in the second RAM region, ends in the third; the hole in
        // between makes it illegal even though both ends are covered.
        assert!(!can_access(
            TestSlice {
                base: 0x2000_7F00,
                size: 0x0000_8200,
            },
            &table,
            writable,
        ));
    }

    #[test]
    fn access_outside_all_regions_rejected() {
        let table = process_regions();
        for base in [0usize, 0x1000_0000, 0x2000_8000, 0xE000_0000] {
            assert!(!can_access(TestSlice { base, size: 16 }, &table, any));
        }
    }

    #[test]
    fn access_overhanging_region_end_rejected() {
        let table = process_regions();
        // Last RAM region is 0x1000 long; run 4 bytes past it.
        assert!(!can_access(
            TestSlice {
                base: 0x2001_0800,
                size: 0x0804,
            },
            &table,
            writable,
        ));
    }
}
