use crate::store::CoordStore;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use botfleet_core::CoordConfig;
use futures_util::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisFuture, Script, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Refuses to extend a lease the caller no longer owns.
const EXTEND_LEADER_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

/// Collapses the stale-check and the acquire into one server-side step so
/// two replicas can never both win the guard.
const ACQUIRE_CYCLE_GUARD_LUA: &str = r"
local existing = redis.call('GET', KEYS[1])
if existing and (tonumber(ARGV[1]) - tonumber(existing)) < tonumber(ARGV[2]) then
  return 0
end
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[3]) then
  return 1
end
return 0
";

/// Single connection handle covering both deployment shapes. The cluster
/// variant is used when `cluster_nodes` is configured.
#[derive(Clone)]
enum Conn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(pipeline, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(pipeline, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(_) => 0,
        }
    }
}

/// Redis-backed [`CoordStore`]. Commands run on a shared multiplexed
/// connection; each `subscribe` opens its own pub/sub connection (pub/sub
/// always goes through the single-node client, even in cluster mode).
pub struct RedisCoord {
    conn: Conn,
    pubsub_client: redis::Client,
    extend_leader: Script,
    acquire_cycle_guard: Script,
}

impl RedisCoord {
    /// Connects and preloads the atomic scripts.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or authentication fails.
    pub async fn connect(config: &CoordConfig) -> Result<Self> {
        let url = connection_url(config, &config.host, config.port);
        let pubsub_client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid coord URL for {}:{}", config.host, config.port))?;

        let conn = match config.cluster_nodes.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(nodes) => {
                let urls: Vec<String> = nodes
                    .split(',')
                    .map(str::trim)
                    .filter(|node| !node.is_empty())
                    .map(|node| cluster_node_url(config, node))
                    .collect();
                tracing::info!("Connecting to coord cluster ({} nodes)", urls.len());
                let client = ClusterClient::new(urls).context("invalid cluster node list")?;
                Conn::Cluster(
                    client
                        .get_async_connection()
                        .await
                        .context("coord cluster unreachable")?,
                )
            }
            None => {
                tracing::info!("Connecting to coord store at {}:{}", config.host, config.port);
                Conn::Single(
                    pubsub_client
                        .get_connection_manager()
                        .await
                        .context("coord store unreachable")?,
                )
            }
        };

        let coord = Self {
            conn,
            pubsub_client,
            extend_leader: Script::new(EXTEND_LEADER_LUA),
            acquire_cycle_guard: Script::new(ACQUIRE_CYCLE_GUARD_LUA),
        };
        coord.preload_scripts().await?;
        Ok(coord)
    }

    async fn preload_scripts(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        for lua in [EXTEND_LEADER_LUA, ACQUIRE_CYCLE_GUARD_LUA] {
            let _sha: String = redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(lua)
                .query_async(&mut conn)
                .await
                .context("failed to preload coord script")?;
        }
        tracing::debug!("Coord scripts preloaded");
        Ok(())
    }
}

fn connection_url(config: &CoordConfig, host: &str, port: u16) -> String {
    match &config.password {
        Some(password) if !password.is_empty() => format!("redis://:{password}@{host}:{port}/"),
        _ => format!("redis://{host}:{port}/"),
    }
}

fn cluster_node_url(config: &CoordConfig, node: &str) -> String {
    if node.starts_with("redis://") || node.starts_with("rediss://") {
        return node.to_string();
    }
    let (host, port) = node
        .split_once(':')
        .map_or((node, 6379), |(h, p)| (h, p.parse().unwrap_or(6379)));
    connection_url(config, host, port)
}

#[async_trait]
impl CoordStore for RedisCoord {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let present: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(present > 0)
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("SCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .pubsub_client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;
        pubsub.subscribe(channel).await?;

        let channel_name = channel.to_string();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Undecodable message on {}: {}", channel_name, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Pub/sub stream for {} ended", channel_name);
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn extend_leader(&self, key: &str, expected: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_leader
            .key(key)
            .arg(expected)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn acquire_cycle_guard(
        &self,
        guard_key: &str,
        now_ms: i64,
        max_age_ms: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = self
            .acquire_cycle_guard
            .key(guard_key)
            .arg(now_ms)
            .arg(max_age_ms)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }
}
