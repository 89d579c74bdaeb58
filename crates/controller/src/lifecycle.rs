use crate::cleanup::{cleanup_bot_state, cleanup_preserving_guard, clear_bot_queue_state};
use crate::controller::Controller;
use anyhow::Result;
use botfleet_coord::safe_run;
use botfleet_core::keys;
use botfleet_gameserver::{JoinError, MatchRoomEvent, QueueRoom, QueueRoomEvent};
use botfleet_registry::BotProfile;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// TTL on the `bots:state:{id}` observability key.
const STATE_TTL_MS: u64 = 3_600_000;

/// Window after the queue join during which a surfaced room error aborts
/// the cycle before any state is asserted.
const SETTLE_WINDOW: Duration = Duration::from_millis(500);

/// Hard ceiling on waiting for a duel. Queue pressure is the reconciler's
/// problem; a bot parked longer than this goes back to the rotation.
const MATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_JOIN_ATTEMPTS: u32 = 5;

/// Backoff for queue-join retries after a seat-reservation rejection:
/// exponential from 150 ms, capped at 1.5 s, plus up to 150 ms of jitter so
/// replicas do not retry in lockstep.
fn join_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let base = 1_500u64.min(150u64 << exp);
    let jitter = rand::thread_rng().gen_range(0..150);
    Duration::from_millis(base + jitter)
}

/// Outcome of the synchronous deploy phase. `Scheduled` means the per-bot
/// cycle task is running; everything else is a clean abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Scheduled,
    GuardHeld,
    AlreadyInMatch,
    MissingProfile,
}

#[derive(Debug, Default)]
struct Observation {
    reservation: bool,
    active: bool,
    in_queue: bool,
    current_match: Option<String>,
}

impl Observation {
    fn any(&self) -> bool {
        self.reservation || self.active || self.in_queue || self.current_match.is_some()
    }
}

async fn observe(ctl: &Controller, bot_id: &str) -> Result<Observation> {
    Ok(Observation {
        reservation: ctl
            .coord
            .get(&keys::reservation_key(bot_id))
            .await?
            .is_some(),
        active: ctl.coord.sismember(keys::ACTIVE_SET, bot_id).await?,
        in_queue: ctl.coord.zscore(keys::QUEUE_ELO, bot_id).await?.is_some(),
        current_match: ctl.coord.get(&keys::current_match_key(bot_id)).await?,
    })
}

/// Drives single bots through the deploy cycle:
/// guard → deploy → queue join → match handoff → play-out → release.
///
/// Any failure past the guard acquisition recycles the bot back to the
/// rotation queue; the cycle guard guarantees at most one task per bot
/// across every controller replica.
pub struct LifecycleDriver {
    ctl: Arc<Controller>,
    cancel: CancellationToken,
}

impl LifecycleDriver {
    #[must_use]
    pub fn new(ctl: Arc<Controller>, cancel: CancellationToken) -> Self {
        Self { ctl, cancel }
    }

    /// Guard phase of the state machine, run inline by the reconciler. On
    /// success the rest of the cycle continues on its own task.
    ///
    /// # Errors
    /// Returns an error when the coord store fails mid-transition; the
    /// pruner recovers whatever was left behind.
    pub async fn deploy(
        &self,
        bot_id: &str,
        initial_join_delay: Duration,
    ) -> Result<DeployOutcome> {
        let ctl = &self.ctl;
        let guard_key = keys::cycling_guard_key(bot_id);
        let acquired = ctl
            .coord
            .acquire_cycle_guard(
                &guard_key,
                Controller::now_ms(),
                ctl.config.max_cycling_time_ms,
                ctl.config.cycling_guard_ttl_secs,
            )
            .await?;
        if !acquired {
            tracing::debug!("Cycle guard for {} held elsewhere, skipping deploy", bot_id);
            return Ok(DeployOutcome::GuardHeld);
        }
        ctl.coord.sadd(keys::CYCLING_SET, bot_id).await?;

        let observed = observe(ctl, bot_id).await?;
        if let Some(match_id) = &observed.current_match {
            tracing::info!("Bot {} already in match {}, aborting deploy", bot_id, match_id);
            ctl.release_cycle_guard(bot_id).await;
            return Ok(DeployOutcome::AlreadyInMatch);
        }
        if observed.any() {
            tracing::info!("Bot {} carries stale queue state, cleaning before deploy", bot_id);
            cleanup_preserving_guard(&*ctl.coord, bot_id, "stale before deploy").await;
        }

        ctl.coord.sadd(keys::DEPLOYED_SET, bot_id).await?;

        let Some(profile) = ctl.directory.get_bot(bot_id).await? else {
            tracing::warn!("Bot {} missing from the directory, undoing deploy", bot_id);
            safe_run("srem-deployed", ctl.coord.srem(keys::DEPLOYED_SET, bot_id)).await;
            ctl.release_cycle_guard(bot_id).await;
            return Ok(DeployOutcome::MissingProfile);
        };

        let task = CycleTask {
            ctl: ctl.clone(),
            profile,
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(task.run(initial_join_delay));
        Ok(DeployOutcome::Scheduled)
    }
}

enum JoinAbort {
    Recycle(&'static str),
    Cancelled,
}

struct CycleTask {
    ctl: Arc<Controller>,
    profile: BotProfile,
    cancel: CancellationToken,
}

impl CycleTask {
    fn bot_id(&self) -> &str {
        &self.profile.bot_id
    }

    async fn run(self, initial_join_delay: Duration) {
        tokio::select! {
            () = self.cancel.cancelled() => return,
            () = sleep(initial_join_delay) => {}
        }
        self.drive().await;
    }

    async fn drive(&self) {
        let bot_id = self.bot_id();

        // The deploy may have been withdrawn while this task waited.
        match self.ctl.coord.sismember(keys::DEPLOYED_SET, bot_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Bot {} no longer deployed, abandoning cycle", bot_id);
                self.ctl.release_cycle_guard(bot_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Deployment check failed for {}: {:#}", bot_id, e);
                self.ctl.release_cycle_guard(bot_id).await;
                return;
            }
        }
        match observe(&self.ctl, bot_id).await {
            Ok(observed) if observed.any() => {
                tracing::info!("Bot {} picked up state before joining, abandoning cycle", bot_id);
                self.ctl.release_cycle_guard(bot_id).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Pre-join observation failed for {}: {:#}", bot_id, e);
                self.ctl.release_cycle_guard(bot_id).await;
                return;
            }
        }

        // Purge any stale seat before joining; the game server's clear
        // endpoint is idempotent.
        clear_bot_queue_state(&*self.ctl.coord, &*self.ctl.game_api, bot_id).await;

        let mut room = match self.join_queue_with_retry().await {
            Ok(room) => room,
            Err(JoinAbort::Recycle(reason)) => {
                self.recycle(None, reason).await;
                return;
            }
            Err(JoinAbort::Cancelled) => return,
        };

        // Settle window: give the room a moment to reject us before
        // asserting queue state.
        let mut early_match: Option<(String, String)> = None;
        {
            let settle = sleep(SETTLE_WINDOW);
            tokio::pin!(settle);
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        let _ = room.leave().await;
                        return;
                    }
                    () = &mut settle => break,
                    event = room.next_event() => match event {
                        Ok(QueueRoomEvent::Queued { position }) => {
                            tracing::debug!("Bot {} queued at position {}", bot_id, position);
                        }
                        Ok(QueueRoomEvent::MatchFound { room_id, match_id, .. }) => {
                            early_match = Some((room_id, match_id));
                            break;
                        }
                        Ok(QueueRoomEvent::Error { code, message }) => {
                            tracing::warn!("Queue room error for {} ({}): {}", bot_id, code, message);
                            self.recycle(Some(&mut room), "queue room error").await;
                            return;
                        }
                        Ok(QueueRoomEvent::Closed) => {
                            self.recycle(Some(&mut room), "queue room closed").await;
                            return;
                        }
                        Err(e) => {
                            tracing::warn!("Queue room failed for {}: {:#}", bot_id, e);
                            self.recycle(Some(&mut room), "queue room error").await;
                            return;
                        }
                    }
                }
            }
        }

        safe_run(
            "set-state-queued",
            self.ctl
                .coord
                .set_px(&keys::state_key(bot_id), "queued", STATE_TTL_MS),
        )
        .await;

        // The game server enrolls the bot into `queue:elo` as part of the
        // join; absence at this point means the enrollment silently failed.
        if early_match.is_none() {
            match self.ctl.coord.zscore(keys::QUEUE_ELO, bot_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.recycle(Some(&mut room), "missing queue membership").await;
                    return;
                }
                Err(e) => {
                    tracing::warn!("Queue membership check failed for {}: {:#}", bot_id, e);
                    self.recycle(Some(&mut room), "queue membership check failed").await;
                    return;
                }
            }
        }

        let (room_id, match_id) = match early_match {
            Some(found) => found,
            None => {
                let wait = wait_for_match(&mut *room, bot_id);
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        let _ = room.leave().await;
                        return;
                    }
                    result = timeout(MATCH_WAIT_TIMEOUT, wait) => match result {
                        Ok(Ok(found)) => found,
                        Ok(Err(reason)) => {
                            self.recycle(Some(&mut room), reason).await;
                            return;
                        }
                        Err(_elapsed) => {
                            self.recycle(Some(&mut room), "match wait timeout").await;
                            return;
                        }
                    }
                }
            }
        };

        self.handoff(room, &room_id, &match_id).await;
    }

    /// Queued → Matched → Playing → Completed. Match-room join comes
    /// before the queue-room leave: leaving first lets the seat
    /// reservation lapse mid-handoff.
    async fn handoff(&self, mut queue_room: Box<dyn QueueRoom>, room_id: &str, match_id: &str) {
        let bot_id = self.bot_id();

        if let Err(e) = self.ctl.coord.sadd(keys::ACTIVE_SET, bot_id).await {
            tracing::warn!("Activation failed for {}: {:#}", bot_id, e);
            self.recycle(Some(&mut queue_room), "activation failed").await;
            return;
        }
        match self.ctl.coord.get(&keys::reservation_key(bot_id)).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.recycle(Some(&mut queue_room), "reservation expired").await;
                return;
            }
            Err(e) => {
                tracing::warn!("Reservation check failed for {}: {:#}", bot_id, e);
                self.recycle(Some(&mut queue_room), "reservation check failed").await;
                return;
            }
        }

        let mut match_room = match self.ctl.rooms.join_match(room_id, bot_id).await {
            Ok(match_room) => match_room,
            Err(e) => {
                tracing::warn!("Match join failed for {}: {:#}", bot_id, e);
                self.recycle(Some(&mut queue_room), "match join failed").await;
                return;
            }
        };
        tracing::info!("Bot {} joined match {} (room {})", bot_id, match_id, room_id);

        if let Ok(Some(_)) = self.ctl.coord.zscore(keys::QUEUE_ELO, bot_id).await {
            safe_run("zrem-queue-elo", self.ctl.coord.zrem(keys::QUEUE_ELO, bot_id)).await;
        }
        safe_run(
            "srem-deployed",
            self.ctl.coord.srem(keys::DEPLOYED_SET, bot_id),
        )
        .await;
        safe_run(
            "set-state-matched",
            self.ctl
                .coord
                .set_px(&keys::state_key(bot_id), "matched", STATE_TTL_MS),
        )
        .await;
        safe_run("queue-room-leave", queue_room.leave()).await;
        drop(queue_room);

        safe_run(
            "set-state-playing",
            self.ctl
                .coord
                .set_px(&keys::state_key(bot_id), "playing", STATE_TTL_MS),
        )
        .await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = match_room.leave().await;
                    return;
                }
                event = match_room.next_event() => match event {
                    Ok(MatchRoomEvent::Init) => {
                        tracing::debug!("Match init for {}", bot_id);
                    }
                    Ok(MatchRoomEvent::CodeUpdate) => {}
                    Ok(MatchRoomEvent::Error { code, message }) => {
                        tracing::warn!("Match room error for {} ({}): {}", bot_id, code, message);
                        break;
                    }
                    Ok(MatchRoomEvent::Closed) => break,
                    Err(e) => {
                        tracing::warn!("Match room failed for {}: {:#}", bot_id, e);
                        break;
                    }
                }
            }
        }

        // Completion. The game server publishes botMatchComplete after it
        // has removed the bot from the active set; publishing here as well
        // would rotate the bot twice.
        safe_run("del-state", self.ctl.coord.del(&keys::state_key(bot_id))).await;
        safe_run("srem-active", self.ctl.coord.srem(keys::ACTIVE_SET, bot_id)).await;
        safe_run(
            "del-reservation",
            self.ctl.coord.del(&keys::reservation_key(bot_id)),
        )
        .await;
        self.ctl.release_cycle_guard(bot_id).await;
        tracing::info!("Bot {} completed its match cycle", bot_id);
    }

    async fn join_queue_with_retry(&self) -> Result<Box<dyn QueueRoom>, JoinAbort> {
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(JoinAbort::Cancelled);
            }
            match self
                .ctl
                .rooms
                .join_queue(self.bot_id(), self.profile.rating)
                .await
            {
                Ok(room) => return Ok(room),
                Err(JoinError::ReservationExpired) if attempt < MAX_JOIN_ATTEMPTS => {
                    let delay = join_backoff(attempt);
                    tracing::debug!(
                        "Seat reservation expired for {}, retrying join in {:?} ({}/{})",
                        self.bot_id(),
                        delay,
                        attempt,
                        MAX_JOIN_ATTEMPTS
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(JoinAbort::Cancelled),
                        () = sleep(delay) => {}
                    }
                }
                Err(JoinError::ReservationExpired) => {
                    return Err(JoinAbort::Recycle("queue join retries exhausted"));
                }
                Err(JoinError::Other(e)) => {
                    tracing::warn!("Queue join failed for {}: {:#}", self.bot_id(), e);
                    return Err(JoinAbort::Recycle("queue room error"));
                }
            }
        }
        Err(JoinAbort::Recycle("queue join retries exhausted"))
    }

    /// Terminal path for every failed cycle: close the room, erase the
    /// bot's footprint, and hand it back to the rotation tail.
    async fn recycle(&self, room: Option<&mut Box<dyn QueueRoom>>, reason: &str) {
        let bot_id = self.bot_id();
        tracing::info!("Recycling bot {}: {}", bot_id, reason);
        if let Some(room) = room {
            safe_run("queue-room-leave", room.leave()).await;
        }
        cleanup_bot_state(&*self.ctl.coord, bot_id, &format!("recycle:{reason}")).await;
        self.ctl.enqueue_rotation(bot_id).await;
        self.ctl.nudge_reconcile();
    }
}

async fn wait_for_match(
    room: &mut dyn QueueRoom,
    bot_id: &str,
) -> Result<(String, String), &'static str> {
    loop {
        match room.next_event().await {
            Ok(QueueRoomEvent::MatchFound { room_id, match_id, .. }) => {
                return Ok((room_id, match_id));
            }
            Ok(QueueRoomEvent::Queued { .. }) => {}
            Ok(QueueRoomEvent::Error { code, message }) => {
                tracing::warn!("Queue room error for {} ({}): {}", bot_id, code, message);
                return Err("queue room error");
            }
            Ok(QueueRoomEvent::Closed) => return Err("queue room closed"),
            Err(e) => {
                tracing::warn!("Queue room failed for {}: {:#}", bot_id, e);
                return Err("queue room error");
            }
        }
    }
}
