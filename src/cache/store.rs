//! Key-value cache abstraction shared by the refresh pipeline and the read path.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// One mutation inside an atomic [`CacheBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    HashSet {
        key: String,
        field: String,
        value: Bytes,
    },
    HashDelete {
        key: String,
        fields: Vec<String>,
    },
    SetAdd {
        key: String,
        members: Vec<String>,
    },
    SetRemove {
        key: String,
        members: Vec<String>,
    },
    CounterSet {
        key: String,
        field: String,
        value: i64,
    },
}

/// Ordered list of mutations applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct CacheBatch {
    ops: Vec<CacheOp>,
}

impl CacheBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(&mut self, key: &str, field: impl Into<String>, value: impl Into<Bytes>) {
        self.ops.push(CacheOp::HashSet {
            key: key.to_string(),
            field: field.into(),
            value: value.into(),
        });
    }

    pub fn hdel(&mut self, key: &str, fields: Vec<String>) {
        if fields.is_empty() {
            return;
        }
        self.ops.push(CacheOp::HashDelete {
            key: key.to_string(),
            fields,
        });
    }

    pub fn sadd(&mut self, key: &str, member: impl Into<String>) {
        self.ops.push(CacheOp::SetAdd {
            key: key.to_string(),
            members: vec![member.into()],
        });
    }

    pub fn srem(&mut self, key: &str, members: Vec<String>) {
        if members.is_empty() {
            return;
        }
        self.ops.push(CacheOp::SetRemove {
            key: key.to_string(),
            members,
        });
    }

    pub fn counter_set(&mut self, key: &str, field: impl Into<String>, value: i64) {
        self.ops.push(CacheOp::CounterSet {
            key: key.to_string(),
            field: field.into(),
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[CacheOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<CacheOp> {
        self.ops
    }
}

/// Hash, set and counter operations over named keyspaces.
///
/// Counters live in their own hashes and hold integers rather than packed
/// bytes; a backend may share storage between the two as long as the
/// semantics below hold.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError>;

    /// Values in the order of `fields`, `None` where absent.
    async fn hget_many(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Bytes>>, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<BTreeMap<String, Bytes>, StoreError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// Members in ascending order.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Members of `key` absent from `minus`, in ascending order.
    async fn sdiff(&self, key: &str, minus: &str) -> Result<Vec<String>, StoreError>;

    async fn counter_get(&self, key: &str, field: &str) -> Result<Option<i64>, StoreError>;

    async fn counter_get_many(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<i64>>, StoreError>;

    /// Add `delta` and return the new value; a missing counter starts at 0.
    async fn counter_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Apply every operation of `batch` atomically with respect to readers.
    async fn exec(&self, batch: CacheBatch) -> Result<(), StoreError>;

    /// Take the lease `key` for `token` unless another token holds an
    /// unexpired lease. Returns whether the lease was taken.
    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release `key` if `token` still holds it; a lease taken over by another
    /// token after expiry is left alone.
    async fn release_lease(&self, key: &str, token: &str) -> Result<(), StoreError>;
}
