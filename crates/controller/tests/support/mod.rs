//! Shared fakes for the controller scenario tests: an in-memory coord
//! store, a scriptable game server (HTTP stats + rooms), and a canned bot
//! directory.

// Each test binary compiles its own copy; not every binary uses every fake.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use botfleet_controller::Controller;
use botfleet_coord::{CoordStore, MemoryCoord};
use botfleet_core::{keys, ControllerConfig};
use botfleet_gameserver::{
    BreakerSnapshot, GameApi, GlobalStats, JoinError, MatchRoom, MatchRoomEvent, MatchServer,
    MatchSummary, QueueRoom, QueueRoomEvent, QueueStats,
};
use botfleet_registry::{BotDirectory, StaticDirectory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        instance_id: "test-instance".to_string(),
        leader_ttl_ms: 15_000,
        deploy_check_interval_ms: 5_000,
        queue_prune_interval_ms: 30_000,
        deploy_delay_ms: 0,
        initial_join_delay_ms: 0,
        extra_bot_wait_threshold_ms: 15_000,
        max_cycling_time_ms: 300_000,
        cycling_guard_ttl_secs: 360,
    }
}

/// Mutable fake of the game server's HTTP stats surface.
pub struct FakeGameApi {
    pub queue: Mutex<QueueStats>,
    pub global: Mutex<GlobalStats>,
    pub matches: Mutex<Vec<MatchSummary>>,
    pub cleared: Mutex<Vec<String>>,
}

impl FakeGameApi {
    pub fn healthy() -> Self {
        Self {
            queue: Mutex::new(QueueStats {
                queue_size: 0,
                bots_in_queue: 0,
                is_stale: false,
            }),
            global: Mutex::new(GlobalStats {
                queued_humans_count: 0,
                longest_human_wait_ms: 0,
                is_stale: false,
            }),
            matches: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
        }
    }

    pub fn stale() -> Self {
        Self {
            queue: Mutex::new(QueueStats::stale()),
            global: Mutex::new(GlobalStats::stale()),
            matches: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
        }
    }

    pub fn set_global(&self, humans: i64, wait_ms: i64) {
        *self.global.lock().unwrap() = GlobalStats {
            queued_humans_count: humans,
            longest_human_wait_ms: wait_ms,
            is_stale: false,
        };
    }
}

#[async_trait]
impl GameApi for FakeGameApi {
    async fn queue_stats(&self) -> QueueStats {
        self.queue.lock().unwrap().clone()
    }

    async fn global_stats(&self) -> GlobalStats {
        self.global.lock().unwrap().clone()
    }

    async fn active_matches(&self) -> Vec<MatchSummary> {
        self.matches.lock().unwrap().clone()
    }

    async fn clear_queue(&self, user_id: &str) -> Result<()> {
        self.cleared.lock().unwrap().push(user_id.to_string());
        Ok(())
    }

    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        Vec::new()
    }
}

/// Scriptable room server. Queue and match rooms replay `(delay, event)`
/// scripts; joins enroll the bot into `queue:elo` and write a seat
/// reservation, mirroring what the real server does. Room lifecycle calls
/// land in `log` so tests can assert ordering.
pub struct ScriptedServer {
    pub coord: MemoryCoord,
    pub queue_events: Mutex<VecDeque<(u64, QueueRoomEvent)>>,
    pub match_events: Mutex<VecDeque<(u64, MatchRoomEvent)>>,
    /// Reject this many queue joins with the reservation-expired error
    /// before accepting.
    pub reject_joins: AtomicU32,
    pub join_count: AtomicU32,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    pub fn new(coord: MemoryCoord) -> Self {
        Self {
            coord,
            queue_events: Mutex::new(VecDeque::new()),
            match_events: Mutex::new(VecDeque::new()),
            reject_joins: AtomicU32::new(0),
            join_count: AtomicU32::new(0),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script_queue(&self, events: Vec<(u64, QueueRoomEvent)>) {
        *self.queue_events.lock().unwrap() = events.into();
    }

    pub fn script_match(&self, events: Vec<(u64, MatchRoomEvent)>) {
        *self.match_events.lock().unwrap() = events.into();
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl MatchServer for ScriptedServer {
    async fn join_queue(
        &self,
        bot_id: &str,
        rating: i64,
    ) -> Result<Box<dyn QueueRoom>, JoinError> {
        self.join_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.reject_joins.load(Ordering::SeqCst);
        if remaining > 0 {
            self.reject_joins.store(remaining - 1, Ordering::SeqCst);
            return Err(JoinError::ReservationExpired);
        }

        self.coord
            .zadd(keys::QUEUE_ELO, bot_id, rating as f64)
            .await;
        self.coord
            .set(&keys::reservation_key(bot_id), "{\"seat\":1}")
            .await
            .map_err(JoinError::Other)?;
        self.log
            .lock()
            .unwrap()
            .push(format!("queue_join:{bot_id}"));

        let events = std::mem::take(&mut *self.queue_events.lock().unwrap());
        Ok(Box::new(FakeRoom {
            events,
            log: self.log.clone(),
            label: format!("queue:{bot_id}"),
        }))
    }

    async fn join_match(&self, match_id: &str, bot_id: &str) -> Result<Box<dyn MatchRoom>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("match_join:{match_id}:{bot_id}"));
        let events = std::mem::take(&mut *self.match_events.lock().unwrap());
        Ok(Box::new(FakeRoom {
            events,
            log: self.log.clone(),
            label: format!("match:{bot_id}"),
        }))
    }
}

pub struct FakeRoom<E> {
    events: VecDeque<(u64, E)>,
    log: Arc<Mutex<Vec<String>>>,
    label: String,
}

impl<E: Send> FakeRoom<E> {
    /// Cancellation-safe: the event is only popped once its delay elapsed,
    /// so a caller that drops the future mid-wait (e.g. the settle window
    /// closing) does not lose the event.
    async fn next(&mut self) -> Result<E> {
        let delay_ms = match self.events.front() {
            Some((delay_ms, _)) => *delay_ms,
            // Script exhausted: the room stays open and silent.
            None => return std::future::pending().await,
        };
        sleep(Duration::from_millis(delay_ms)).await;
        match self.events.pop_front() {
            Some((_, event)) => Ok(event),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().push(format!("leave:{}", self.label));
        Ok(())
    }
}

#[async_trait]
impl QueueRoom for FakeRoom<QueueRoomEvent> {
    async fn next_event(&mut self) -> Result<QueueRoomEvent> {
        self.next().await
    }

    async fn leave(&mut self) -> Result<()> {
        self.close().await
    }
}

#[async_trait]
impl MatchRoom for FakeRoom<MatchRoomEvent> {
    async fn next_event(&mut self) -> Result<MatchRoomEvent> {
        self.next().await
    }

    async fn leave(&mut self) -> Result<()> {
        self.close().await
    }
}

pub struct Harness {
    pub coord: MemoryCoord,
    pub api: Arc<FakeGameApi>,
    pub server: Arc<ScriptedServer>,
    pub ctl: Arc<Controller>,
}

pub fn harness_with(fleet_size: usize, api: FakeGameApi) -> Harness {
    let coord = MemoryCoord::new();
    let api = Arc::new(api);
    let server = Arc::new(ScriptedServer::new(coord.clone()));
    let directory: Arc<dyn BotDirectory> =
        Arc::new(StaticDirectory::with_fleet(fleet_size, 1200));
    let ctl = Arc::new(Controller::new(
        Arc::new(coord.clone()),
        api.clone(),
        server.clone(),
        directory,
        test_config(),
    ));
    Harness {
        coord,
        api,
        server,
        ctl,
    }
}

pub fn harness(fleet_size: usize) -> Harness {
    harness_with(fleet_size, FakeGameApi::healthy())
}

/// Polls `check` until it returns true. Under a paused clock the sleeps
/// auto-advance, so this drives the spawned lifecycle tasks to completion
/// deterministically. The horizon (4000 × 250 ms ≈ 17 min of virtual time)
/// comfortably covers the 5-minute match-wait timeout.
pub async fn wait_until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..4_000 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(250)).await;
    }
    panic!("condition not reached in time");
}
