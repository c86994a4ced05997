//! Plan catalog cache.
//!
//! The catalog lives in a handful of named hashes and sets (see [`keys`]).
//! Two backends implement [`CacheStore`]:
//!
//! - [`MemoryCacheStore`]: process-local, used by tests and single-node setups
//! - [`RedisCacheStore`]: shared with the other catalog consumers
//!
//! Selected via `plancache.toml`:
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379/0"
//! ```

pub mod keys;
pub(crate) mod lock;
mod memory;
mod redis_store;
mod store;

pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;
pub use store::{CacheBatch, CacheOp, CacheStore, StoreError};
