//! Zones: per-owner bump allocators over chains of pooled segments
//!
//! A [`Zone`] serves many small allocations with a shared lifetime out of
//! large [`Segment`]s and releases them all at once. The fast path is a
//! pointer bump inside the current head segment; when that runs out, the
//! zone grows by requesting a bigger segment from its
//! [`AccountingAllocator`] using a high-water-mark policy (double the
//! previous segment, clamped between a minimum and a maximum).
//!
//! # Safety
//!
//! The single unsafe boundary is the bump itself: [`Zone::try_alloc_bytes`]
//! carves a fresh, non-overlapping byte range out of segment memory the
//! zone exclusively owns and hands it out as a pointer. The typed helpers
//! ([`Zone::alloc`], [`Zone::alloc_slice`], [`Zone::alloc_str`]) wrap that
//! boundary into safe references tied to the zone's borrow. The growth
//! arithmetic and chain bookkeeping are entirely safe code.
//!
//! A zone is single-owner: allocation takes `&self` through `Cell`s, with
//! no synchronization, so the type is not `Sync`. Zones on different
//! threads share memory only through their common allocator.
//!
//! Allocated values are never dropped; a zone reclaims memory, not
//! destructors.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::allocator::AccountingAllocator;
use crate::error::{MemoryError, Result};
use crate::segment::{SEGMENT_HEADER_SIZE, Segment};
use crate::utils::{align_up, is_aligned};

/// Every zone allocation is aligned to the platform pointer size.
pub const ALIGNMENT: usize = mem::size_of::<usize>();

/// Never request segments smaller than this.
pub const MINIMUM_SEGMENT_SIZE: usize = 8 * 1024;

/// Never grow segments past this, except when a single request needs more.
pub const MAXIMUM_SEGMENT_SIZE: usize = 1024 * 1024;

/// A zone whose live allocation total crosses this limit logs one warning.
pub const ZONE_EXCESS_LIMIT: usize = 256 * 1024 * 1024;

/// Gap inserted after each allocation for overflow-detection
/// instrumentation. Zero unless a sanitizer build wires it up.
pub const REDZONE_BYTES: usize = 0;

/// Per-segment cost of header plus worst-case start alignment.
const SEGMENT_OVERHEAD: usize = SEGMENT_HEADER_SIZE + ALIGNMENT;

/// Extra bytes needed so that a pointer-aligned `position` also lands on an
/// 8-byte boundary when `size` is divisible by 8.
///
/// Only meaningful on 32-bit-pointer targets, where `ALIGNMENT` is 4:
/// keeping 8-byte-divisible allocations 8-byte aligned gives callers a
/// stronger guarantee than the pointer size alone. `size` must already be
/// a multiple of `ALIGNMENT`.
#[inline]
const fn eight_byte_alignment_padding(position: usize, size: usize) -> usize {
    (!size & 4) & (position & 4)
}

/// Sanitizer instrumentation seams; no-ops unless such a build replaces
/// them.
#[inline(always)]
fn asan_poison_region(_start: *mut u8, _len: usize) {}

#[inline(always)]
fn asan_unpoison_region(_start: *mut u8, _len: usize) {}

#[cold]
#[inline(never)]
fn fatal_process_out_of_memory(zone: &str, err: MemoryError) -> ! {
    // A zone that cannot grow has no recovery path; a corrupted or
    // half-expanded arena must not keep running.
    error!(zone, %err, "fatal process out of memory");
    std::process::abort();
}

/// Per-owner bump allocator backed by a chain of segments.
///
/// Bound to one [`AccountingAllocator`] for its whole life; dropping the
/// zone returns every owned segment to it. There is no per-object free;
/// [`Zone::delete_all`] (or drop) is the only release mechanism.
pub struct Zone {
    /// Bytes handed out to callers so far; excludes header, alignment and
    /// redzone overhead. Monotonic until reset.
    allocation_size: Cell<usize>,
    /// Total bytes owned via segments, including memory obtained from the
    /// allocator but not yet handed out.
    segment_bytes_allocated: Cell<usize>,
    /// The free region of the head segment is the half-open range
    /// [position, limit); position stays aligned to [`ALIGNMENT`].
    position: Cell<*mut u8>,
    limit: Cell<*mut u8>,
    /// Owned segments, most recently acquired first.
    segment_head: RefCell<Option<Box<Segment>>>,
    allocator: Arc<AccountingAllocator>,
    /// Diagnostic label; no behavioral effect.
    name: &'static str,
    excess_reported: Cell<bool>,
}

impl Zone {
    /// Creates an empty zone bound to `allocator`. No segment is acquired
    /// until the first allocation.
    pub fn new(allocator: Arc<AccountingAllocator>, name: &'static str) -> Self {
        debug!(zone = name, "zone created");
        Self {
            allocation_size: Cell::new(0),
            segment_bytes_allocated: Cell::new(0),
            position: Cell::new(ptr::null_mut()),
            limit: Cell::new(ptr::null_mut()),
            segment_head: RefCell::new(None),
            allocator,
            name,
            excess_reported: Cell::new(false),
        }
    }

    /// Allocates `size` bytes, aligned to the pointer size.
    ///
    /// Never fails: an unsatisfiable request (system allocator refusal or
    /// growth-arithmetic overflow) aborts the process, because this layer
    /// has no recovery path. Use [`Zone::try_alloc_bytes`] to observe the
    /// error instead.
    pub fn alloc_bytes(&self, size: usize) -> NonNull<u8> {
        match self.try_alloc_bytes(size) {
            Ok(ptr) => ptr,
            Err(err) => fatal_process_out_of_memory(self.name, err),
        }
    }

    /// Fallible variant of [`Zone::alloc_bytes`].
    ///
    /// The returned pointer addresses `size` bytes of uninitialized,
    /// exclusively owned storage, valid until [`Zone::delete_all`] or drop.
    pub fn try_alloc_bytes(&self, size: usize) -> Result<NonNull<u8>> {
        let requested = size;
        let size = size
            .checked_next_multiple_of(ALIGNMENT)
            .ok_or(MemoryError::size_overflow(requested))?;

        let mut position = self.position.get() as usize;
        if ALIGNMENT == 4 {
            position += eight_byte_alignment_padding(position, size);
        }

        let size_with_redzone = size
            .checked_add(REDZONE_BYTES)
            .ok_or(MemoryError::size_overflow(requested))?;

        // The alignment correction can momentarily push position past
        // limit, so compare before subtracting.
        let limit = self.limit.get() as usize;
        let result = if position == 0 || limit < position || size_with_redzone > limit - position
        {
            self.expand(size_with_redzone)?
        } else {
            self.position.set((position + size_with_redzone) as *mut u8);
            // SAFETY: position is non-null and points into the head
            // segment's free region (bounds checked just above).
            unsafe { NonNull::new_unchecked(position as *mut u8) }
        };

        // SAFETY: result + size is at most the new position, which stays
        // within the segment; one-past ranges are valid to compute.
        asan_poison_region(unsafe { result.as_ptr().add(size) }, REDZONE_BYTES);

        let total = self.allocation_size.get() + size;
        self.allocation_size.set(total);
        if total > ZONE_EXCESS_LIMIT && !self.excess_reported.get() {
            self.excess_reported.set(true);
            warn!(
                zone = self.name,
                allocation_size = total,
                "zone exceeded the excess limit"
            );
        }

        debug_assert!(is_aligned(result.as_ptr() as usize, ALIGNMENT));
        Ok(result)
    }

    /// Moves `value` into the zone and returns a reference living as long
    /// as the zone's current epoch. The value's destructor never runs.
    pub fn alloc<T>(&self, value: T) -> &mut T {
        const {
            assert!(
                mem::align_of::<T>() <= ALIGNMENT,
                "zone storage is aligned to the pointer size only"
            )
        };

        let ptr = self.alloc_bytes(mem::size_of::<T>()).as_ptr().cast::<T>();
        // SAFETY: ptr is freshly carved out, sized and aligned for T, and
        // exclusively ours; writing initializes it, and the returned
        // borrow cannot outlive the storage because delete_all takes
        // &mut self.
        unsafe {
            ptr.write(value);
            &mut *ptr
        }
    }

    /// Copies `slice` into the zone.
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &mut [T] {
        const {
            assert!(
                mem::align_of::<T>() <= ALIGNMENT,
                "zone storage is aligned to the pointer size only"
            )
        };

        if slice.is_empty() {
            return &mut [];
        }

        let ptr = self
            .alloc_bytes(mem::size_of_val(slice))
            .as_ptr()
            .cast::<T>();
        // SAFETY: destination is a fresh allocation of size_of_val(slice)
        // bytes, properly aligned, and cannot overlap the source.
        unsafe {
            ptr::copy_nonoverlapping(slice.as_ptr(), ptr, slice.len());
            std::slice::from_raw_parts_mut(ptr, slice.len())
        }
    }

    /// Copies `s` into the zone.
    pub fn alloc_str(&self, s: &str) -> &str {
        let bytes = self.alloc_slice(s.as_bytes());
        // SAFETY: bytes are a verbatim copy of valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }

    /// Returns every owned segment to the allocator and resets the zone to
    /// empty, invalidating all outstanding allocations (hence `&mut self`).
    pub fn delete_all(&mut self) {
        let mut current = self.segment_head.borrow_mut().take();
        while let Some(mut segment) = current {
            current = segment.take_next();
            asan_unpoison_region(segment.start(), segment.capacity());
            self.segment_bytes_allocated
                .set(self.segment_bytes_allocated.get() - segment.size());
            self.allocator.return_segment(segment);
        }
        debug_assert_eq!(self.segment_bytes_allocated.get(), 0);

        self.position.set(ptr::null_mut());
        self.limit.set(ptr::null_mut());
        self.allocation_size.set(0);
        self.excess_reported.set(false);
    }

    /// Logical bytes handed out since creation or the last reset.
    pub fn allocation_size(&self) -> usize {
        self.allocation_size.get()
    }

    /// Bytes currently owned via segments; a superset of
    /// [`Zone::allocation_size`].
    pub fn segment_bytes_allocated(&self) -> usize {
        self.segment_bytes_allocated.get()
    }

    /// Diagnostic name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The allocator this zone draws from.
    pub fn allocator(&self) -> &AccountingAllocator {
        &self.allocator
    }

    /// Acquires a new head segment sized by the high-water-mark policy and
    /// re-points the free region at it.
    ///
    /// `size` must already be aligned and not fit the current free region.
    #[cold]
    fn expand(&self, size: usize) -> Result<NonNull<u8>> {
        let old_size = self.segment_head.borrow().as_ref().map_or(0, |s| s.size());

        // Double the previous segment, plus room for this request and the
        // header; any wrap here is an unsatisfiable request.
        let grown = old_size
            .checked_mul(2)
            .and_then(|doubled| doubled.checked_add(size))
            .ok_or(MemoryError::size_overflow(size))?;
        let mut new_size = SEGMENT_OVERHEAD
            .checked_add(grown)
            .ok_or(MemoryError::size_overflow(size))?;
        let min_new_size = SEGMENT_OVERHEAD + size;

        if new_size < MINIMUM_SEGMENT_SIZE {
            new_size = MINIMUM_SEGMENT_SIZE;
        } else if new_size > MAXIMUM_SEGMENT_SIZE {
            // Cap growth to keep worst-case waste bounded, but never below
            // what this request itself needs.
            new_size = min_new_size.max(MAXIMUM_SEGMENT_SIZE);
        }
        if new_size > isize::MAX as usize {
            return Err(MemoryError::size_overflow(size));
        }

        let (start, end) = self.push_segment(new_size)?;

        let result = align_up(start, ALIGNMENT);
        debug_assert!(result + size <= end);
        self.position.set((result + size) as *mut u8);
        self.limit.set(end as *mut u8);

        // SAFETY: result points at the aligned start of the fresh
        // segment's payload, which accommodates size bytes.
        Ok(unsafe { NonNull::new_unchecked(result as *mut u8) })
    }

    /// Requests a segment of `new_size` total bytes and links it at the
    /// front of the chain.
    fn push_segment(&self, new_size: usize) -> Result<(usize, usize)> {
        let mut segment = self
            .allocator
            .get_segment(new_size)
            .ok_or(MemoryError::out_of_memory(new_size))?;
        debug_assert!(segment.size() >= new_size);

        self.segment_bytes_allocated
            .set(self.segment_bytes_allocated.get() + segment.size());

        let (start, end) = (segment.start() as usize, segment.end() as usize);
        let mut head = self.segment_head.borrow_mut();
        segment.set_next(head.take());
        *head = Some(segment);
        Ok((start, end))
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        debug!(
            zone = self.name,
            allocation_size = self.allocation_size.get(),
            "zone destroyed"
        );
        self.delete_all();
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("allocation_size", &self.allocation_size.get())
            .field("segment_bytes_allocated", &self.segment_bytes_allocated.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shared_allocator() -> Arc<AccountingAllocator> {
        Arc::new(AccountingAllocator::new())
    }

    #[test]
    fn basic_allocation() {
        let zone = Zone::new(shared_allocator(), "basic");
        let value = zone.alloc(42u32);
        *value += 1;
        assert_eq!(*value, 43);
    }

    #[test]
    fn pointers_are_aligned_and_size_is_logical() {
        let zone = Zone::new(shared_allocator(), "align");

        let a = zone.alloc_bytes(100);
        let b = zone.alloc_bytes(100);
        assert!(is_aligned(a.as_ptr() as usize, ALIGNMENT));
        assert!(is_aligned(b.as_ptr() as usize, ALIGNMENT));

        // 100 rounds up to the next ALIGNMENT multiple per allocation.
        let rounded = align_up(100, ALIGNMENT);
        assert_eq!(zone.allocation_size(), 2 * rounded);
        assert!(zone.segment_bytes_allocated() >= zone.allocation_size());
    }

    #[test]
    fn zero_size_allocation_is_non_null() {
        let zone = Zone::new(shared_allocator(), "zero");
        let ptr = zone.alloc_bytes(0);
        assert!(is_aligned(ptr.as_ptr() as usize, ALIGNMENT));
        assert_eq!(zone.allocation_size(), 0);
    }

    #[test]
    fn exhaustion_triggers_exactly_one_expand() {
        let allocator = shared_allocator();
        let zone = Zone::new(Arc::clone(&allocator), "grow");

        zone.alloc_bytes(8_000);
        assert_eq!(allocator.system_segment_allocations(), 1);

        // Does not fit what is left of the 8 KB head segment.
        zone.alloc_bytes(8_000);
        assert_eq!(allocator.system_segment_allocations(), 2);

        // Small allocations resume the fast bump path.
        for _ in 0..100 {
            zone.alloc_bytes(8);
        }
        assert_eq!(allocator.system_segment_allocations(), 2);
    }

    #[test]
    fn oversized_request_gets_exactly_what_it_needs() {
        let allocator = shared_allocator();
        let zone = Zone::new(allocator, "huge");

        zone.alloc_bytes(100);
        zone.alloc_bytes(100);
        zone.alloc_bytes(2_000_000);

        // The growth candidate exceeds the cap, so the segment is sized to
        // the request alone.
        let head = zone.segment_head.borrow();
        assert_eq!(
            head.as_ref().unwrap().size(),
            SEGMENT_OVERHEAD + 2_000_000
        );
    }

    #[test]
    fn growth_is_capped_at_maximum_segment_size() {
        let allocator = shared_allocator();
        let zone = Zone::new(allocator, "capped");

        zone.alloc_bytes(600_000);
        zone.alloc_bytes(600_000);

        // Doubling 600 KB would blow past the cap; the request itself
        // fits inside it.
        let head = zone.segment_head.borrow();
        assert_eq!(head.as_ref().unwrap().size(), MAXIMUM_SEGMENT_SIZE);
    }

    #[test]
    fn delete_all_resets_and_recycles() {
        let allocator = shared_allocator();
        let mut zone = Zone::new(Arc::clone(&allocator), "reset");

        zone.alloc_bytes(100);
        assert!(zone.segment_bytes_allocated() > 0);

        zone.delete_all();
        assert_eq!(zone.allocation_size(), 0);
        assert_eq!(zone.segment_bytes_allocated(), 0);
        // The segment went back to the pool, not to the system.
        assert_eq!(
            allocator.current_pool_size(),
            allocator.current_memory_usage()
        );

        // Reuse draws from the pool without a fresh system allocation.
        let before = allocator.system_segment_allocations();
        zone.alloc_bytes(100);
        assert_eq!(allocator.system_segment_allocations(), before);
    }

    #[test]
    fn drop_returns_all_segments() {
        let allocator = shared_allocator();
        {
            let zone = Zone::new(Arc::clone(&allocator), "scoped");
            zone.alloc_bytes(64);
            zone.alloc_bytes(50_000);
        }
        assert_eq!(
            allocator.current_pool_size(),
            allocator.current_memory_usage()
        );
        assert!(allocator.current_pool_size() > 0);
    }

    #[test]
    fn typed_allocations() {
        let zone = Zone::new(shared_allocator(), "typed");

        let value = zone.alloc(7u64);
        *value *= 6;
        assert_eq!(*value, 42);

        let slice = zone.alloc_slice(&[1u32, 2, 3]);
        slice[0] = 9;
        assert_eq!(slice, &[9, 2, 3]);

        let s = zone.alloc_str("zone");
        assert_eq!(s, "zone");

        let empty: &mut [u32] = zone.alloc_slice(&[]);
        assert!(empty.is_empty());
    }

    #[test]
    fn many_values_stay_intact() {
        let zone = Zone::new(shared_allocator(), "dense");
        let values: Vec<&mut usize> = (0..10_000).map(|i| zone.alloc(i)).collect();
        for (i, value) in values.iter().enumerate() {
            assert_eq!(**value, i);
        }
    }

    #[test]
    fn eight_byte_padding_rule() {
        // Pads only when the size is 8-byte divisible and the position
        // sits on an odd 4-byte boundary.
        assert_eq!(eight_byte_alignment_padding(0, 8), 0);
        assert_eq!(eight_byte_alignment_padding(4, 8), 4);
        assert_eq!(eight_byte_alignment_padding(4, 12), 0);
        assert_eq!(eight_byte_alignment_padding(8, 16), 0);
        assert_eq!(eight_byte_alignment_padding(12, 16), 4);
    }

    proptest! {
        #[test]
        fn allocations_are_aligned_and_disjoint(
            sizes in proptest::collection::vec(1usize..512, 1..64)
        ) {
            let zone = Zone::new(shared_allocator(), "prop");
            let mut ranges = Vec::with_capacity(sizes.len());
            for &size in &sizes {
                let ptr = zone.try_alloc_bytes(size).unwrap();
                let addr = ptr.as_ptr() as usize;
                prop_assert!(is_aligned(addr, ALIGNMENT));
                ranges.push((addr, size));
            }

            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
        }
    }
}
