//! Memory pools backing request arguments.
//!
//! A [`MemoryPool`] is mapped once per request; the resulting [`MappedPool`]
//! gives bounds-checked byte access until it is dropped.

mod mapped;
mod pool;

pub use mapped::FileMemory;
pub use pool::{HostMemory, MappedPool, MemoryError, MemoryPool};
