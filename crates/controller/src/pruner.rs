use crate::cleanup::cleanup_bot_state;
use crate::controller::Controller;
use botfleet_coord::safe_run;
use botfleet_core::keys;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Leader-only hygiene sweep. Crashed lifecycle tasks, killed replicas,
/// and game-server restarts all leave partial footprints behind; each tick
/// walks the shared state and puts every bot back into exactly one place.
pub struct Pruner {
    ctl: Arc<Controller>,
}

impl Pruner {
    #[must_use]
    pub fn new(ctl: Arc<Controller>) -> Self {
        Self { ctl }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.ctl.config.queue_prune_interval_ms);
        tracing::info!("Pruner started (tick {:?})", interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(interval) => {}
            }
            self.run_once().await;
        }
        tracing::info!("Pruner stopped");
    }

    pub async fn run_once(&self) {
        let stale = prune_stale_cycling_bots(&self.ctl).await;
        let orphaned = prune_deployed_bots(&self.ctl).await;
        let recovered = recover_limbo_bots(&self.ctl).await;
        if stale + orphaned + recovered > 0 {
            tracing::info!(
                "Prune pass: {} stale guard(s), {} orphaned deploy(s), {} limbo bot(s)",
                stale,
                orphaned,
                recovered
            );
            self.ctl.nudge_reconcile();
        }
    }
}

/// Clears cycle guards that are orphaned (set membership without the
/// companion string) or older than the cycling allowance. A bot that is
/// demonstrably mid-match only loses the guard; one with no other footprint
/// is fully cleaned and re-enqueued.
pub async fn prune_stale_cycling_bots(ctl: &Controller) -> usize {
    let Some(cycling) = safe_run("smembers-cycling", ctl.coord.smembers(keys::CYCLING_SET)).await
    else {
        return 0;
    };

    let now_ms = Controller::now_ms();
    let mut pruned = 0;
    for bot_id in cycling {
        let guard = safe_run(
            "get-cycle-guard",
            ctl.coord.get(&keys::cycling_guard_key(&bot_id)),
        )
        .await
        .flatten();

        let stale = match guard {
            None => true,
            Some(raw) => {
                let acquired_at: i64 = raw.parse().unwrap_or(0);
                now_ms - acquired_at > ctl.config.max_cycling_time_ms
            }
        };
        if !stale {
            continue;
        }

        let demonstrably_active = is_demonstrably_active(ctl, &bot_id).await;
        if demonstrably_active {
            tracing::info!("Clearing stale guard for busy bot {}", bot_id);
            ctl.release_cycle_guard(&bot_id).await;
        } else {
            tracing::info!("Recycling bot {} stuck in a stale cycle", bot_id);
            cleanup_bot_state(&*ctl.coord, &bot_id, "stale cycle guard").await;
            ctl.enqueue_rotation(&bot_id).await;
        }
        pruned += 1;
    }
    pruned
}

async fn is_demonstrably_active(ctl: &Controller, bot_id: &str) -> bool {
    let in_active = safe_run("sismember-active", ctl.coord.sismember(keys::ACTIVE_SET, bot_id))
        .await
        .unwrap_or(false);
    let in_match = safe_run(
        "get-current-match",
        ctl.coord.get(&keys::current_match_key(bot_id)),
    )
    .await
    .flatten()
    .is_some();
    let reserved = safe_run(
        "get-reservation",
        ctl.coord.get(&keys::reservation_key(bot_id)),
    )
    .await
    .flatten()
    .is_some();
    in_active || in_match || reserved
}

/// Returns deployed bots that have lost their entire queue footprint (no
/// queue membership, no state, no reservation, not active) and are not in
/// a live cycle. Such bots were in limbo for at least one observation.
pub async fn prune_deployed_bots(ctl: &Controller) -> usize {
    let Some(deployed) = safe_run("smembers-deployed", ctl.coord.smembers(keys::DEPLOYED_SET)).await
    else {
        return 0;
    };

    let now_ms = Controller::now_ms();
    let mut recycled = 0;
    for bot_id in deployed {
        let in_queue = safe_run("zscore-elo", ctl.coord.zscore(keys::QUEUE_ELO, &bot_id))
            .await
            .flatten()
            .is_some();
        let has_state = safe_run("get-state", ctl.coord.get(&keys::state_key(&bot_id)))
            .await
            .flatten()
            .is_some();
        let reserved = safe_run(
            "get-reservation",
            ctl.coord.get(&keys::reservation_key(&bot_id)),
        )
        .await
        .flatten()
        .is_some();
        let active = safe_run("sismember-active", ctl.coord.sismember(keys::ACTIVE_SET, &bot_id))
            .await
            .unwrap_or(false);
        if in_queue || has_state || reserved || active {
            continue;
        }

        // A young guard means a deploy cycle legitimately owns the bot and
        // simply has not joined yet.
        let mid_cycle = safe_run(
            "get-cycle-guard",
            ctl.coord.get(&keys::cycling_guard_key(&bot_id)),
        )
        .await
        .flatten()
        .is_some_and(|raw| {
            let acquired_at: i64 = raw.parse().unwrap_or(0);
            now_ms - acquired_at <= ctl.config.max_cycling_time_ms
        });
        if mid_cycle {
            continue;
        }

        tracing::info!("Recycling orphaned deployed bot {}", bot_id);
        safe_run("srem-deployed", ctl.coord.srem(keys::DEPLOYED_SET, &bot_id)).await;
        ctl.release_cycle_guard(&bot_id).await;
        ctl.enqueue_rotation(&bot_id).await;
        recycled += 1;
    }
    recycled
}

/// Walks the full bot directory and re-enqueues bots that are tracked
/// nowhere: not deployed, active, cycling, rotating, queued, reserved, or
/// inside a live match. A `bot:current_match` pointer whose match is absent
/// from `matches:active` is stale and gets cleared on the way.
pub async fn recover_limbo_bots(ctl: &Controller) -> usize {
    let profiles = match ctl.directory.list_bots().await {
        Ok(profiles) => profiles,
        Err(e) => {
            tracing::warn!("Limbo sweep could not list the directory: {:#}", e);
            return 0;
        }
    };

    let rotation: HashSet<String> =
        safe_run("lrange-rotation", ctl.coord.lrange(keys::ROTATION_QUEUE, 0, -1))
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
    let deployed: HashSet<String> =
        safe_run("smembers-deployed", ctl.coord.smembers(keys::DEPLOYED_SET))
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
    let active: HashSet<String> = safe_run("smembers-active", ctl.coord.smembers(keys::ACTIVE_SET))
        .await
        .unwrap_or_default()
        .into_iter()
        .collect();
    let cycling: HashSet<String> =
        safe_run("smembers-cycling", ctl.coord.smembers(keys::CYCLING_SET))
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
    let live_matches: HashSet<String> =
        safe_run("smembers-matches", ctl.coord.smembers(keys::MATCHES_ACTIVE))
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

    let mut recovered = 0;
    for profile in profiles {
        let bot_id = &profile.bot_id;
        if rotation.contains(bot_id)
            || deployed.contains(bot_id)
            || active.contains(bot_id)
            || cycling.contains(bot_id)
        {
            continue;
        }
        let in_queue = safe_run("zscore-elo", ctl.coord.zscore(keys::QUEUE_ELO, bot_id))
            .await
            .flatten()
            .is_some();
        let reserved = safe_run(
            "get-reservation",
            ctl.coord.get(&keys::reservation_key(bot_id)),
        )
        .await
        .flatten()
        .is_some();
        if in_queue || reserved {
            continue;
        }

        match safe_run(
            "get-current-match",
            ctl.coord.get(&keys::current_match_key(bot_id)),
        )
        .await
        .flatten()
        {
            Some(match_id) if live_matches.contains(&match_id) => continue,
            Some(match_id) => {
                tracing::info!(
                    "Bot {} points at dead match {}, clearing and recovering",
                    bot_id,
                    match_id
                );
                safe_run(
                    "del-current-match",
                    ctl.coord.del(&keys::current_match_key(bot_id)),
                )
                .await;
            }
            None => {}
        }

        tracing::info!("Recovering limbo bot {}", bot_id);
        ctl.enqueue_rotation(bot_id).await;
        recovered += 1;
    }
    recovered
}
