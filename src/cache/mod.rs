//! Named response caches and the cache-first layer in front of the network.
//!
//! This module provides:
//! - A storage trait over named caches of request → response entries
//! - SQLite-backed persistent storage and an in-memory equivalent
//! - A layer that answers from any cache first, falls back to the network,
//!   and stores good responses into the current cache in the background

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
