//! Second-level record cache.
//!
//! The cache is shared across transactions and threads. It never fetches on
//! its own: the [`BatchedLoader`](crate::BatchedLoader) populates it after
//! store reads, and the [`WriteThroughInvalidator`](crate::WriteThroughInvalidator)
//! keeps it in line with committed writes.
//!
//! # Generations
//!
//! Population races invalidation. A loader reads the namespace
//! [`Generation`] before probing, fetches its misses, then calls
//! [`SecondLevelCache::put_batch`] with the generation it saw. Any eviction
//! or write-through in between moves the generation and the population is
//! dropped, so a record read before a write can never land after it.

pub mod entry;
pub mod memory;
pub mod traits;
pub mod watermark;

pub use entry::CacheEntry;
pub use memory::InMemoryCache;
pub use traits::{CacheStats, Generation, SecondLevelCache};
pub use watermark::{UpdateWatermarks, WatermarkSnapshot};
