use crate::controller::Controller;
use crate::leader::LeaderState;
use crate::pruner;
use botfleet_coord::safe_run;
use botfleet_core::{keys, rotation, FleetCommand};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Delay before re-checking activity in `rotate_bot`; absorbs the race
/// with the game server's own post-match cleanup.
const ROTATE_RECHECK_DELAY: Duration = Duration::from_millis(100);

/// Listens on `bots:commands` and routes admin-console and game-server
/// events into the controller. Every replica subscribes; followers log and
/// ignore, only the leader acts.
pub struct CommandSubscriber {
    ctl: Arc<Controller>,
    leader_rx: watch::Receiver<LeaderState>,
}

impl CommandSubscriber {
    #[must_use]
    pub fn new(ctl: Arc<Controller>, leader_rx: watch::Receiver<LeaderState>) -> Self {
        Self { ctl, leader_rx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let mut rx = match self.ctl.coord.subscribe(keys::COMMANDS_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!("Command subscription failed, retrying: {:#}", e);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            tracing::info!("Subscribed to {}", keys::COMMANDS_CHANNEL);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    message = rx.recv() => match message {
                        Some(payload) => self.handle(&payload).await,
                        None => {
                            tracing::warn!("Command stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, payload: &str) {
        let command: FleetCommand = match serde_json::from_str(payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Discarding unknown command {:?}: {}", payload, e);
                return;
            }
        };

        if !self.leader_rx.borrow().is_leader {
            tracing::debug!("Follower ignoring command {:?}", command);
            return;
        }

        match command {
            FleetCommand::Deploy => self.start_bot_cycles().await,
            FleetCommand::Stop { bot_ids } => self.stop(bot_ids).await,
            FleetCommand::BotMatchComplete { bot_id } => rotate_bot(&self.ctl, &bot_id).await,
            FleetCommand::RotateConfig { max_deployed } => {
                tracing::info!("Rotation config update: totalBots = {}", max_deployed);
                safe_run(
                    "hset-rotation-config",
                    self.ctl.coord.hset(
                        keys::ROTATION_CONFIG,
                        rotation::TOTAL_BOTS_FIELD,
                        &max_deployed.to_string(),
                    ),
                )
                .await;
                self.ctl.nudge_reconcile();
            }
            FleetCommand::PlayerQueued | FleetCommand::PlayerDequeued => {
                // Queue pressure is re-read every reconciliation tick; no
                // immediate action.
                tracing::debug!("Player queue event received");
            }
        }
    }

    /// `deploy` command: seed the rotation queue from the directory and
    /// resume deployments.
    async fn start_bot_cycles(&self) {
        self.ctl.resume_deployments();
        let recovered = pruner::recover_limbo_bots(&self.ctl).await;
        tracing::info!(
            "Deploy command: rotation seeded ({} bot(s) recovered), reconciling",
            recovered
        );
        self.ctl.nudge_reconcile();
    }

    async fn stop(&self, bot_ids: Option<Vec<String>>) {
        match bot_ids {
            Some(ids) if !ids.is_empty() => {
                tracing::info!("Stop command for {} bot(s)", ids.len());
                for bot_id in ids {
                    safe_run(
                        "srem-deployed",
                        self.ctl.coord.srem(keys::DEPLOYED_SET, &bot_id),
                    )
                    .await;
                }
            }
            _ => {
                tracing::info!("Full stop: pausing deployments and clearing the deployed set");
                self.ctl.pause_deployments();
                if let Some(deployed) =
                    safe_run("smembers-deployed", self.ctl.coord.smembers(keys::DEPLOYED_SET)).await
                {
                    for bot_id in deployed {
                        safe_run(
                            "srem-deployed",
                            self.ctl.coord.srem(keys::DEPLOYED_SET, &bot_id),
                        )
                        .await;
                        self.ctl.enqueue_rotation(&bot_id).await;
                    }
                }
            }
        }
    }
}

/// Returns a bot to the rotation after the game server reported its match
/// complete. The bot must be verifiably idle: a 100 ms re-check covers the
/// window where the game server is still tearing the match down.
pub async fn rotate_bot(ctl: &Controller, bot_id: &str) {
    let active = safe_run("sismember-active", ctl.coord.sismember(keys::ACTIVE_SET, bot_id))
        .await
        .unwrap_or(false);
    if active {
        sleep(ROTATE_RECHECK_DELAY).await;
        let still = safe_run("sismember-active", ctl.coord.sismember(keys::ACTIVE_SET, bot_id))
            .await
            .unwrap_or(true);
        if still {
            tracing::debug!("Bot {} still active, skipping rotation", bot_id);
            return;
        }
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
        tracing::debug!("Bot {} still has queue state, skipping rotation", bot_id);
        return;
    }

    ctl.release_cycle_guard(bot_id).await;
    ctl.enqueue_rotation(bot_id).await;
    tracing::info!("Rotated bot {} back into the queue", bot_id);
    ctl.nudge_reconcile();
}
