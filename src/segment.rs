//! Segments: contiguous memory blocks backing zone allocation
//!
//! A [`Segment`] owns one block obtained from the system allocator. The
//! block starts with a small in-place header recording its total size; the
//! remainder is the payload handed to a zone for bump allocation.
//!
//! Segments form singly-linked chains through `next`, and a segment is a
//! member of exactly one chain at a time: either a pool bucket's free list
//! or a zone's owned-segment chain. Chain edits are ownership moves of
//! `Box<Segment>`, never aliasable pointer writes, so "pop from the pool"
//! and "push onto a zone" transfer the whole block along with the handle.

use std::alloc::{Layout, alloc, dealloc};
use std::mem;
use std::ptr::{self, NonNull};

/// Byte value used to wipe dead memory so that use-after-release reads are
/// deterministic and easy to spot in a debugger.
pub const ZAP_DEAD_BYTE: u8 = 0xcd;

/// Header written at the start of every segment's backing block.
#[repr(C)]
struct SegmentHeader {
    size: usize,
}

/// Bytes of each segment reserved for the header; the payload starts
/// immediately after.
pub const SEGMENT_HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();

/// A single contiguous memory block with an embedded header.
///
/// `size` is the total byte count of the block including the header;
/// `capacity` is what remains for the owning zone.
pub struct Segment {
    ptr: NonNull<u8>,
    size: usize,
    next: Option<Box<Segment>>,
}

// SAFETY: A Segment exclusively owns its backing block; the raw pointer is
// never shared outside the handle, so moving the handle across threads
// moves sole access to the block with it.
unsafe impl Send for Segment {}

impl Segment {
    /// Allocates a fresh block of `size` bytes from the system allocator
    /// and initializes its header.
    ///
    /// Returns `None` when the system allocator fails or the size cannot
    /// form a valid layout; callers decide whether that is fatal.
    pub(crate) fn allocate(size: usize) -> Option<Box<Segment>> {
        debug_assert!(size > SEGMENT_HEADER_SIZE);

        let layout = Layout::from_size_align(size, mem::align_of::<SegmentHeader>()).ok()?;

        // SAFETY: layout has non-zero size (checked above) and a valid
        // power-of-two alignment. A null return means allocation failure
        // and is handled by NonNull::new.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw)?;

        // SAFETY: the block is at least SEGMENT_HEADER_SIZE bytes and
        // aligned for SegmentHeader; we own it and may initialize it.
        unsafe {
            ptr.as_ptr().cast::<SegmentHeader>().write(SegmentHeader { size });
        }

        Some(Box::new(Segment {
            ptr,
            size,
            next: None,
        }))
    }

    /// Total bytes of the block, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes usable by the owning zone.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - SEGMENT_HEADER_SIZE
    }

    /// First payload byte, just past the header.
    #[inline]
    pub(crate) fn start(&self) -> *mut u8 {
        // SAFETY: SEGMENT_HEADER_SIZE < size, so the offset stays inside
        // the allocation.
        unsafe { self.ptr.as_ptr().add(SEGMENT_HEADER_SIZE) }
    }

    /// One past the last payload byte.
    #[inline]
    pub(crate) fn end(&self) -> *mut u8 {
        // SAFETY: size is the allocation size; add(size) is the one-past-end
        // pointer, valid for arithmetic and comparison.
        unsafe { self.ptr.as_ptr().add(self.size) }
    }

    /// Size recorded in the in-place header.
    #[cfg(test)]
    pub(crate) fn header_size(&self) -> usize {
        // SAFETY: the header was initialized in allocate() and stays intact
        // until zap_header() runs during drop.
        unsafe { (*self.ptr.as_ptr().cast::<SegmentHeader>()).size }
    }

    /// Overwrites the entire payload (not the header) with the zap byte.
    ///
    /// Run when the owning zone releases the segment, so stale references
    /// into it read a recognizable pattern instead of old object bytes.
    pub(crate) fn zap_contents(&mut self) {
        // SAFETY: [start, start + capacity) is exactly the payload region of
        // the block we own, and we hold &mut self.
        unsafe {
            ptr::write_bytes(self.start(), ZAP_DEAD_BYTE, self.capacity());
        }
    }

    /// Overwrites the header with the zap byte, making the segment
    /// unrecognizable. Only done right before the block goes back to the
    /// system allocator.
    fn zap_header(&mut self) {
        // SAFETY: the header region is the first SEGMENT_HEADER_SIZE bytes
        // of the block we own. After this the in-place size is garbage; the
        // handle's copy in self.size is still used for deallocation.
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr(), ZAP_DEAD_BYTE, SEGMENT_HEADER_SIZE);
        }
    }

    /// Links `next` behind this segment, taking ownership of the chain.
    #[inline]
    pub(crate) fn set_next(&mut self, next: Option<Box<Segment>>) {
        debug_assert!(self.next.is_none());
        self.next = next;
    }

    /// Detaches and returns the rest of the chain.
    #[inline]
    pub(crate) fn take_next(&mut self) -> Option<Box<Segment>> {
        self.next.take()
    }

    #[inline]
    pub(crate) fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Unlink the chain iteratively; dropping a long pool bucket or zone
        // chain through recursive Box drops would exhaust the stack.
        let mut next = self.next.take();
        while let Some(mut segment) = next {
            next = segment.take_next();
        }

        self.zap_header();
        // SAFETY: ptr was obtained from alloc() with this exact size and
        // alignment, and Drop runs at most once.
        unsafe {
            dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.size, mem::align_of::<SegmentHeader>()),
            );
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("chained", &self.next.is_some())
            .finish()
    }
}
