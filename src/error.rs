//! Error types for zone allocation operations

/// Result type for zone allocation operations
pub type Result<T> = core::result::Result<T, MemoryError>;

/// Memory operation errors
///
/// Only two failure categories exist at this layer: the system allocator
/// refused a request, or segment-growth arithmetic wrapped. Everything else
/// (pool-capacity rejection, pressure eviction) is policy, handled
/// internally and never surfaced as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The system allocator returned null
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested from the system allocator
        requested: usize,
    },

    /// Segment growth arithmetic overflowed
    #[error("segment size computation overflowed for a {requested}-byte request")]
    SizeOverflow {
        /// Bytes the caller asked the zone for
        requested: usize,
    },
}

impl MemoryError {
    /// Create an out of memory error
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Create a size overflow error
    pub fn size_overflow(requested: usize) -> Self {
        Self::SizeOverflow { requested }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_request_size() {
        let err = MemoryError::out_of_memory(4096);
        assert!(err.to_string().contains("4096"));

        let err = MemoryError::size_overflow(usize::MAX);
        assert!(err.to_string().contains("overflow"));
    }
}
