use crate::controller::Controller;
use crate::lifecycle::{DeployOutcome, LifecycleDriver};
use crate::pruner;
use anyhow::Result;
use botfleet_coord::safe_run;
use botfleet_core::{keys, RotationSettings};
use botfleet_gameserver::{GlobalStats, QueueStats};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// What one reconciliation tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Deploy(i64),
    Undeploy(i64),
    Hold,
}

/// Pure deployment policy.
///
/// Priority order: top up to the configured minimum, then surge-deploy one
/// bot per waiting human once the longest wait crosses the threshold, all
/// capped by `total_bots`. Stale stats are treated as zero humans and zero
/// queued bots, which collapses every decision to "hold the minimum". A
/// game-server outage must never cause over-deployment; undeploys are
/// still gated per-bot on live coord state.
#[must_use]
pub fn plan(
    settings: &RotationSettings,
    effective: i64,
    queue: &QueueStats,
    global: &GlobalStats,
    surge_threshold_ms: i64,
) -> Plan {
    let queued_humans = if global.is_stale { 0 } else { global.queued_humans_count };
    let longest_wait_ms = if global.is_stale { 0 } else { global.longest_human_wait_ms };
    let bots_in_queue = if queue.is_stale { 0 } else { queue.bots_in_queue };

    let mut to_deploy = if effective < settings.min_deployed {
        settings.min_deployed - effective
    } else if queued_humans > 0 && longest_wait_ms > surge_threshold_ms {
        (queued_humans - bots_in_queue).max(0)
    } else {
        0
    };

    if settings.total_bots > 0 {
        to_deploy = to_deploy.min(settings.total_bots - effective).max(0);
    }

    if to_deploy > 0 {
        return Plan::Deploy(to_deploy);
    }

    let excess = effective - settings.min_deployed;
    if excess > 0 && queued_humans == 0 {
        Plan::Undeploy(excess)
    } else {
        Plan::Hold
    }
}

/// Leader-only reconciliation loop: compares the desired fleet size against
/// observed queue pressure every tick and deploys or withdraws bots.
pub struct Reconciler {
    ctl: Arc<Controller>,
    driver: LifecycleDriver,
}

impl Reconciler {
    #[must_use]
    pub fn new(ctl: Arc<Controller>, cancel: CancellationToken) -> Self {
        let driver = LifecycleDriver::new(ctl.clone(), cancel);
        Self { ctl, driver }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.ctl.config.deploy_check_interval_ms);
        tracing::info!("Reconciler started (tick {:?})", interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(interval) => {}
                () = self.ctl.reconcile_nudged() => {}
            }
            if let Err(e) = self.run_once().await {
                tracing::warn!("Reconciliation tick failed: {:#}", e);
            }
        }
        tracing::info!("Reconciler stopped");
    }

    /// One reconciliation pass.
    ///
    /// # Errors
    /// Returns an error when the coord store is unreachable; the next tick
    /// retries.
    pub async fn run_once(&self) -> Result<()> {
        let ctl = &self.ctl;
        let settings = RotationSettings::from_map(
            &ctl.coord.hgetall(keys::ROTATION_CONFIG).await?,
            ctl.config.deploy_delay_ms,
            ctl.config.initial_join_delay_ms,
        );

        let current_deployed = ctl.coord.scard(keys::DEPLOYED_SET).await?;
        let current_active = ctl.coord.scard(keys::ACTIVE_SET).await?;
        let effective = current_deployed + current_active;

        let queue = ctl.game_api.queue_stats().await;
        let global = ctl.game_api.global_stats().await;

        if settings.total_bots > 0 && settings.total_bots < settings.min_deployed {
            tracing::warn!(
                "totalBots ({}) is below minDeployed ({}); deploying up to totalBots only",
                settings.total_bots,
                settings.min_deployed
            );
        }

        match plan(
            &settings,
            effective,
            &queue,
            &global,
            ctl.config.extra_bot_wait_threshold_ms,
        ) {
            Plan::Deploy(count) => self.deploy_batch(count, &settings).await,
            Plan::Undeploy(excess) => self.undeploy_excess(excess).await,
            Plan::Hold => Ok(()),
        }
    }

    async fn deploy_batch(&self, count: i64, settings: &RotationSettings) -> Result<()> {
        if self.ctl.deployments_paused() {
            tracing::debug!("Deployments paused, skipping batch of {}", count);
            return Ok(());
        }
        tracing::info!("Deploying {} bot(s)", count);
        for i in 0..count {
            if i > 0 {
                sleep(Duration::from_millis(settings.deploy_delay_ms)).await;
            }
            let mut popped = self.ctl.coord.lpop(keys::ROTATION_QUEUE).await?;
            if popped.is_none() && i == 0 {
                // Rotation ran dry before the very first deploy; sweep for
                // limbo bots once and retry.
                let recovered = pruner::recover_limbo_bots(&self.ctl).await;
                tracing::info!("Rotation queue empty, recovered {} limbo bot(s)", recovered);
                popped = self.ctl.coord.lpop(keys::ROTATION_QUEUE).await?;
            }
            let Some(bot_id) = popped else {
                tracing::warn!("Rotation queue exhausted after {} of {} deploys", i, count);
                break;
            };

            let delay = Duration::from_millis(settings.initial_join_delay_ms);
            match self.driver.deploy(&bot_id, delay).await {
                Ok(DeployOutcome::Scheduled) => {}
                Ok(outcome) => {
                    tracing::info!("Deploy of {} aborted: {:?}", bot_id, outcome);
                }
                Err(e) => {
                    tracing::warn!("Deploy of {} failed: {:#}", bot_id, e);
                }
            }
        }
        Ok(())
    }

    /// Withdraws idle excess. Only bots that are not in a match, hold no
    /// seat reservation, and have no queue membership are eligible; a bot
    /// that is visibly mid-queue stays put.
    async fn undeploy_excess(&self, excess: i64) -> Result<()> {
        let deployed = self.ctl.coord.smembers(keys::DEPLOYED_SET).await?;
        let active: HashSet<String> = self
            .ctl
            .coord
            .smembers(keys::ACTIVE_SET)
            .await?
            .into_iter()
            .collect();

        let mut undeployed = 0i64;
        for bot_id in deployed {
            if undeployed >= excess {
                break;
            }
            if active.contains(&bot_id) {
                continue;
            }
            let has_reservation = self
                .ctl
                .coord
                .get(&keys::reservation_key(&bot_id))
                .await?
                .is_some();
            let in_queue = self
                .ctl
                .coord
                .zscore(keys::QUEUE_ELO, &bot_id)
                .await?
                .is_some();
            if has_reservation || in_queue {
                continue;
            }
            self.undeploy_bot(&bot_id).await;
            undeployed += 1;
        }
        if undeployed > 0 {
            tracing::info!("Withdrew {} excess bot(s)", undeployed);
        }
        Ok(())
    }

    async fn undeploy_bot(&self, bot_id: &str) {
        safe_run(
            "srem-deployed",
            self.ctl.coord.srem(keys::DEPLOYED_SET, bot_id),
        )
        .await;
        self.ctl.enqueue_rotation(bot_id).await;
        self.ctl.release_cycle_guard(bot_id).await;
        tracing::info!("Undeployed bot {}", bot_id);
    }
}
