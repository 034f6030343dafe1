//! Reading remote objects
//!
//! [`ObjectReader`] gives a seekable handle backed by a per-handle
//! [`ReadAheadCache`] over ranged GETs.

pub mod handle;
pub mod readahead;

pub use handle::{HttpRangeFetcher, ObjectReader};
pub use readahead::{Chunk, RangeFetcher, ReadAheadCache};
