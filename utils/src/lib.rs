// A set of helper structs for common operations
//
// This crate holds the infrastructure the renderer is built on:
// logging, pooled events, the thread pool, and the lock-free and
// per-frame containers.
#[macro_use]
pub mod logging;
pub mod event;
pub mod framealloc;
pub mod list;
pub mod log;
pub mod lru;
pub mod pool;
pub mod ring;
pub mod stackalloc;
pub mod task;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};

/// Helper to perform max on PartialOrd types
///
/// We are using PartialOrd so that size and offset can handle
/// floating point types that do not support Ord
pub fn partial_max<T: PartialOrd>(a: T, b: T) -> T {
    if a >= b {
        return a;
    } else {
        return b;
    }
}

/// Helper to perform min on PartialOrd types
pub fn partial_min<T: PartialOrd>(a: T, b: T) -> T {
    if a <= b {
        return a;
    } else {
        return b;
    }
}
