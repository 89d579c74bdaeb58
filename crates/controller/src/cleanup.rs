use botfleet_coord::{safe_run, CoordStore};
use botfleet_core::keys;
use botfleet_gameserver::GameApi;

/// Per-step outcome of one cleanup pass, for the log line and for tests.
#[derive(Debug)]
pub struct CleanupReport {
    pub steps: Vec<(&'static str, bool)>,
}

impl CleanupReport {
    #[must_use]
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|(_, ok)| !ok).count()
    }
}

/// Erases every trace of a bot from the coordination store. Deterministic
/// and idempotent: each step runs through the safe-op wrapper and a failed
/// step never prevents the remaining ones.
pub async fn cleanup_bot_state(
    coord: &dyn CoordStore,
    bot_id: &str,
    reason: &str,
) -> CleanupReport {
    run_cleanup(coord, bot_id, reason, false).await
}

/// Cleanup for a caller that still owns the bot's cycle guard and intends
/// to keep it (the stale-before-deploy path). The guard steps are skipped.
pub(crate) async fn cleanup_preserving_guard(
    coord: &dyn CoordStore,
    bot_id: &str,
    reason: &str,
) -> CleanupReport {
    run_cleanup(coord, bot_id, reason, true).await
}

async fn run_cleanup(
    coord: &dyn CoordStore,
    bot_id: &str,
    reason: &str,
    keep_guard: bool,
) -> CleanupReport {
    let mut steps: Vec<(&'static str, bool)> = Vec::with_capacity(8);

    if !keep_guard {
        let guard_key = keys::cycling_guard_key(bot_id);
        steps.push((
            "del-cycle-guard",
            safe_run("del-cycle-guard", coord.del(&guard_key)).await.is_some(),
        ));
        steps.push((
            "srem-cycling",
            safe_run("srem-cycling", coord.srem(keys::CYCLING_SET, bot_id))
                .await
                .is_some(),
        ));
    }

    steps.push((
        "srem-deployed",
        safe_run("srem-deployed", coord.srem(keys::DEPLOYED_SET, bot_id))
            .await
            .is_some(),
    ));
    steps.push((
        "srem-active",
        safe_run("srem-active", coord.srem(keys::ACTIVE_SET, bot_id))
            .await
            .is_some(),
    ));
    steps.push((
        "del-state",
        safe_run("del-state", coord.del(&keys::state_key(bot_id)))
            .await
            .is_some(),
    ));
    steps.push((
        "del-current-match",
        safe_run("del-current-match", coord.del(&keys::current_match_key(bot_id)))
            .await
            .is_some(),
    ));
    steps.push((
        "del-reservation",
        safe_run("del-reservation", coord.del(&keys::reservation_key(bot_id)))
            .await
            .is_some(),
    ));
    steps.push((
        "zrem-queue-elo",
        safe_run("zrem-queue-elo", coord.zrem(keys::QUEUE_ELO, bot_id))
            .await
            .is_some(),
    ));

    let report = CleanupReport { steps };
    if report.failed_steps() > 0 {
        tracing::warn!(
            "Cleaned up bot {} (reason: {}) with {} failed steps",
            bot_id,
            reason,
            report.failed_steps()
        );
    } else {
        tracing::info!("Cleaned up bot {} (reason: {})", bot_id, reason);
    }
    report
}

/// Purges a bot's queue footprint on both sides: asks the game server to
/// drop any seat reservation it holds, then erases the queue keys. Used as
/// the pre-join purge so a fresh deploy never inherits a stale seat.
pub async fn clear_bot_queue_state(coord: &dyn CoordStore, game_api: &dyn GameApi, bot_id: &str) {
    safe_run("http-queue-clear", game_api.clear_queue(bot_id)).await;
    safe_run(
        "del-reservation",
        coord.del(&keys::reservation_key(bot_id)),
    )
    .await;
    safe_run("zrem-queue-elo", coord.zrem(keys::QUEUE_ELO, bot_id)).await;
}
