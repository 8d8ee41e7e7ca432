//! Two-tier memory allocation for short-lived, bulk-freed workloads
//!
//! This crate provides the allocation substrate for components that create
//! many small objects with a shared lifetime and release them all at once
//! (a parser's or compiler's working memory, a request's scratch space):
//!
//! - [`Zone`]: a per-owner bump allocator where allocation is a pointer
//!   bump and release is wholesale
//! - [`AccountingAllocator`]: a shared segment source behind the zones,
//!   with a bucketed free-list pool, live/peak memory accounting, and
//!   pressure-aware recycling
//! - [`Segment`]: the contiguous blocks flowing between the two
//!
//! Zones are deliberately not general-purpose: there is no per-object
//! free, no compaction, and a single zone belongs to one logical owner.
//! The allocator underneath is shared freely across threads.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use zone_alloc::{AccountingAllocator, Zone};
//!
//! let allocator = Arc::new(AccountingAllocator::new());
//!
//! let zone = Zone::new(Arc::clone(&allocator), "parser");
//! let node = zone.alloc(42u32);
//! *node += 1;
//! assert_eq!(*node, 43);
//!
//! let greeting = zone.alloc_str("hello");
//! assert_eq!(greeting, "hello");
//!
//! // Dropping the zone returns its segments for reuse.
//! drop(zone);
//! assert!(allocator.current_pool_size() > 0);
//! ```

#![warn(missing_docs)]

pub mod allocator;
pub mod error;
mod segment;
pub mod utils;
pub mod zone;

pub use allocator::{AccountingAllocator, AllocatorStats, MemoryPressure};
pub use error::{MemoryError, Result};
pub use segment::{SEGMENT_HEADER_SIZE, Segment, ZAP_DEAD_BYTE};
pub use zone::Zone;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
