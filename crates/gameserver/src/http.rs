use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of `GET /queue/size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_size: i64,
    pub bots_in_queue: i64,
    /// Set on breaker fallbacks; stale values must never justify extra
    /// deployments.
    #[serde(default)]
    pub is_stale: bool,
}

impl QueueStats {
    #[must_use]
    pub const fn stale() -> Self {
        Self {
            queue_size: 0,
            bots_in_queue: 0,
            is_stale: true,
        }
    }
}

/// Snapshot of `GET /global/general-stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub queued_humans_count: i64,
    pub longest_human_wait_ms: i64,
    #[serde(default)]
    pub is_stale: bool,
}

impl GlobalStats {
    #[must_use]
    pub const fn stale() -> Self {
        Self {
            queued_humans_count: 0,
            longest_human_wait_ms: 0,
            is_stale: true,
        }
    }
}

/// One entry of `GET /admin/matches/active`. The payload is an opaque match
/// document; only the id is consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSummary {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ActiveMatchesResponse {
    matches: Vec<MatchSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearQueueRequest<'a> {
    user_id: &'a str,
}

/// Typed RPC surface of the game server consumed by the controller. The
/// stats reads are infallible: a broken endpoint degrades to a stale
/// fallback instead of an error.
#[async_trait]
pub trait GameApi: Send + Sync {
    async fn queue_stats(&self) -> QueueStats;
    async fn global_stats(&self) -> GlobalStats;
    async fn active_matches(&self) -> Vec<MatchSummary>;
    /// Idempotent purge of any seat reservation the game server holds for
    /// the bot. Called before every queue join.
    async fn clear_queue(&self, user_id: &str) -> Result<()>;
    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot>;
}

/// Per-endpoint breakers, shared with the health listener.
pub struct BreakerBoard {
    pub queue_stats: CircuitBreaker,
    pub global_stats: CircuitBreaker,
    pub active_matches: CircuitBreaker,
}

impl BreakerBoard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue_stats: CircuitBreaker::new("queue_stats"),
            global_stats: CircuitBreaker::new("global_stats"),
            active_matches: CircuitBreaker::new("active_matches"),
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.queue_stats.snapshot(),
            self.global_stats.snapshot(),
            self.active_matches.snapshot(),
        ]
    }
}

impl Default for BreakerBoard {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GameServerClient {
    http: reqwest::Client,
    base_url: String,
    secret: Option<String>,
    breakers: Arc<BreakerBoard>,
    rate_limiter: Arc<RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>>,
}

impl GameServerClient {
    /// Creates a client for the game server's HTTP surface.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: &str, secret: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build game-server HTTP client")?;

        // 20 requests per second, matching the server-side allowance.
        let quota = Quota::per_second(NonZeroU32::new(20).expect("nonzero"));

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            breakers: Arc::new(BreakerBoard::new()),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    #[must_use]
    pub fn breakers(&self) -> Arc<BreakerBoard> {
        self.breakers.clone()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            builder = builder.header("X-Bot-Secret", secret);
        }
        builder
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {path} returned an error status"))?;
        let body = response
            .json()
            .await
            .with_context(|| format!("GET {path} returned invalid JSON"))?;
        Ok(body)
    }
}

#[async_trait]
impl GameApi for GameServerClient {
    async fn queue_stats(&self) -> QueueStats {
        self.breakers
            .queue_stats
            .execute(|| self.fetch_json("/queue/size"), QueueStats::stale)
            .await
    }

    async fn global_stats(&self) -> GlobalStats {
        self.breakers
            .global_stats
            .execute(
                || self.fetch_json("/global/general-stats"),
                GlobalStats::stale,
            )
            .await
    }

    async fn active_matches(&self) -> Vec<MatchSummary> {
        self.breakers
            .active_matches
            .execute(
                || async {
                    let response: ActiveMatchesResponse =
                        self.fetch_json("/admin/matches/active").await?;
                    Ok(response.matches)
                },
                Vec::new,
            )
            .await
    }

    async fn clear_queue(&self, user_id: &str) -> Result<()> {
        self.rate_limiter.until_ready().await;
        self.request(reqwest::Method::POST, "/queue/clear")
            .json(&ClearQueueRequest { user_id })
            .send()
            .await
            .context("POST /queue/clear failed")?
            .error_for_status()
            .context("POST /queue/clear returned an error status")?;
        Ok(())
    }

    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }
}
