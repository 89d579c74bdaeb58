use crate::store::CoordStore;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};

/// In-process [`CoordStore`] with the same observable semantics as the
/// Redis implementation: lazy TTL expiry, LREM/RPUSH list behavior, and the
/// two scripts executed atomically under the store lock. The suites run the
/// whole controller against it; it also backs local development without a
/// coord server.
///
/// Expiry uses `tokio::time::Instant`, so paused-time tests can advance the
/// clock deterministically.
#[derive(Clone, Default)]
pub struct MemoryCoord {
    inner: Arc<Mutex<Inner>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl Inner {
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        if let Some(entry) = self.strings.get(key) {
            if entry
                .expires_at
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                self.strings.remove(key);
                return None;
            }
        }
        self.strings.get(key)
    }
}

impl MemoryCoord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seeds a sorted-set member. Not part of [`CoordStore`]: the
    /// controller never writes `queue:elo`, but the game-server side of a
    /// simulation does.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) {
        self.lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }
}

#[async_trait]
impl CoordStore for MemoryCoord {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        Ok(inner.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        self.lock().strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut inner = self.lock();
        if inner.live_string(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.lists.remove(key);
        inner.sets.remove(key);
        inner.zsets.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64> {
        let mut inner = self.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        if count == 0 {
            list.retain(|item| item != value);
        } else {
            // Positive count removes head-first, negative tail-first.
            let mut remaining = count.unsigned_abs() as usize;
            let mut kept: VecDeque<String> = VecDeque::with_capacity(before);
            let items: Vec<String> = if count > 0 {
                list.drain(..).collect()
            } else {
                list.drain(..).rev().collect()
            };
            for item in items {
                if remaining > 0 && item == value {
                    remaining -= 1;
                } else if count > 0 {
                    kept.push_back(item);
                } else {
                    kept.push_front(item);
                }
            }
            *list = kept;
        }
        Ok((before - list.len()) as i64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as i64;
        let clamp = |idx: i64| -> i64 {
            let resolved = if idx < 0 { len + idx } else { idx };
            resolved.clamp(0, len.saturating_sub(1).max(0))
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (from, to) = (clamp(start), clamp(stop));
        if from > to {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        Ok(self.lock().lists.get(key).map_or(0, |list| list.len() as i64))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        Ok(self.lock().sets.get(key).map_or(0, |set| set.len() as i64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map_or_else(Vec::new, |set| set.iter().cloned().collect()))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self
            .lock()
            .zsets
            .get(key)
            .and_then(|zset| zset.get(member).copied()))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .zsets
            .get_mut(key)
            .is_some_and(|zset| zset.remove(member).is_some()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let sender = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut broadcast_rx = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(payload) = broadcast_rx.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn extend_leader(&self, key: &str, expected: &str, ttl_ms: u64) -> Result<bool> {
        let mut inner = self.lock();
        let matches = inner
            .live_string(key)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            if let Some(entry) = inner.strings.get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
            }
        }
        Ok(matches)
    }

    async fn acquire_cycle_guard(
        &self,
        guard_key: &str,
        now_ms: i64,
        max_age_ms: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut inner = self.lock();
        if let Some(entry) = inner.live_string(guard_key) {
            let acquired_at: i64 = entry.value.parse().unwrap_or(0);
            if now_ms - acquired_at < max_age_ms {
                return Ok(false);
            }
            // Stale by age but not yet expired; NX still refuses it. The
            // pruner is responsible for deleting over-age guards.
            return Ok(false);
        }
        inner.strings.insert(
            guard_key.to_string(),
            StringEntry {
                value: now_ms.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(true)
    }
}
