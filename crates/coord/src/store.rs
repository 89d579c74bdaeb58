use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Typed facade over the coordination store.
///
/// Every operation the controller performs against shared state goes through
/// this trait, which keeps the call sites honest about the contract (§ key
/// semantics live in `botfleet_core::keys`) and lets the test suites run
/// against [`crate::MemoryCoord`].
///
/// The two script methods are server-side atomic: the check and the write
/// happen in one step on the store, never as separate round trips.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// SET with a millisecond expiry.
    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()>;
    /// SET NX with a millisecond expiry; true when the key was absent.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    /// LREM semantics: count 0 removes every occurrence.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<i64>;

    /// True when the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    /// True when the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<i64>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    /// Opens a dedicated subscriber connection; messages arrive on the
    /// returned channel until the receiver is dropped or the connection
    /// dies (the receiver then yields `None`).
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    async fn ping(&self) -> Result<()>;

    /// Refresh the leader lease only if it still carries `expected`.
    /// Returns false when the lease is gone or owned by someone else.
    async fn extend_leader(&self, key: &str, expected: &str, ttl_ms: u64) -> Result<bool>;

    /// Take the per-bot cycle guard. Returns false when a guard younger
    /// than `max_age_ms` already exists (another cycle owns the bot).
    /// On success the guard value is `now_ms` with a `ttl_secs` expiry.
    async fn acquire_cycle_guard(
        &self,
        guard_key: &str,
        now_ms: i64,
        max_age_ms: i64,
        ttl_secs: u64,
    ) -> Result<bool>;
}
