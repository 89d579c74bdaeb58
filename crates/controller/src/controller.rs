use botfleet_coord::{safe_run, CoordStore};
use botfleet_core::{keys, ControllerConfig};
use botfleet_gameserver::{GameApi, MatchServer};
use botfleet_registry::BotDirectory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared dependency bundle for the controller tasks. One value is built by
/// the supervisor at startup and handed to every component; nothing in this
/// crate reaches for globals.
///
/// All fleet state lives in the coord store. The only in-process state here
/// is the reconcile nudge and the deployment pause flag, both of which are
/// advisory.
pub struct Controller {
    pub coord: Arc<dyn CoordStore>,
    pub game_api: Arc<dyn GameApi>,
    pub rooms: Arc<dyn MatchServer>,
    pub directory: Arc<dyn BotDirectory>,
    pub config: ControllerConfig,
    reconcile_nudge: Notify,
    deployments_paused: AtomicBool,
}

impl Controller {
    #[must_use]
    pub fn new(
        coord: Arc<dyn CoordStore>,
        game_api: Arc<dyn GameApi>,
        rooms: Arc<dyn MatchServer>,
        directory: Arc<dyn BotDirectory>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            coord,
            game_api,
            rooms,
            directory,
            config,
            reconcile_nudge: Notify::new(),
            deployments_paused: AtomicBool::new(false),
        }
    }

    /// Asks the reconciler to run a tick ahead of its interval.
    pub fn nudge_reconcile(&self) {
        self.reconcile_nudge.notify_one();
    }

    pub(crate) async fn reconcile_nudged(&self) {
        self.reconcile_nudge.notified().await;
    }

    /// A full-fleet `stop` command pauses deployments until the next
    /// `deploy` command. Pruning and lifecycle completion keep running.
    pub fn pause_deployments(&self) {
        self.deployments_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_deployments(&self) {
        self.deployments_paused.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn deployments_paused(&self) -> bool {
        self.deployments_paused.load(Ordering::SeqCst)
    }

    /// Current wall-clock in milliseconds, the unit of the guard
    /// timestamps.
    #[must_use]
    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Drops the per-bot cycle guard (both the timestamp string and the
    /// enumeration set entry). Best effort.
    pub(crate) async fn release_cycle_guard(&self, bot_id: &str) {
        let guard_key = keys::cycling_guard_key(bot_id);
        safe_run("release-cycle-guard", self.coord.del(&guard_key)).await;
        safe_run(
            "release-cycle-guard-set",
            self.coord.srem(keys::CYCLING_SET, bot_id),
        )
        .await;
    }

    /// Returns a bot to the rotation tail. The remove-then-append keeps the
    /// list duplicate-free no matter how many paths race to re-enqueue.
    pub(crate) async fn enqueue_rotation(&self, bot_id: &str) {
        safe_run(
            "rotation-dedup",
            self.coord.lrem(keys::ROTATION_QUEUE, 0, bot_id),
        )
        .await;
        safe_run(
            "rotation-append",
            self.coord.rpush(keys::ROTATION_QUEUE, bot_id),
        )
        .await;
    }
}
