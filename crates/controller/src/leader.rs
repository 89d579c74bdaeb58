use botfleet_coord::{safe_run, CoordStore};
use botfleet_core::keys;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Published on the leadership watch channel. Edges (promote/demote) are
/// what the supervisor reacts to; the payload also feeds the health
/// endpoint.
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub is_leader: bool,
    pub instance_id: String,
    pub last_renewal: Option<DateTime<Utc>>,
}

/// Single-leader election over the `bots:leader` lease.
///
/// Acquisition is SET NX PX; renewal goes through the atomic extend script
/// so an instance that lost the lease can never stretch it. A failed
/// renewal demotes locally without touching any fleet state, and the next
/// leader takes over observation cleanly.
pub struct LeaderElector {
    coord: Arc<dyn CoordStore>,
    instance_id: String,
    ttl_ms: u64,
    tx: watch::Sender<LeaderState>,
}

impl LeaderElector {
    #[must_use]
    pub fn new(
        coord: Arc<dyn CoordStore>,
        instance_id: String,
        ttl_ms: u64,
    ) -> (Self, watch::Receiver<LeaderState>) {
        let (tx, rx) = watch::channel(LeaderState {
            is_leader: false,
            instance_id: instance_id.clone(),
            last_renewal: None,
        });
        (
            Self {
                coord,
                instance_id,
                ttl_ms,
                tx,
            },
            rx,
        )
    }

    /// Election loop: attempt to acquire or renew every `ttl / 2`. After
    /// ten consecutive coord failures the loop backs off exponentially up
    /// to 30 s, then resumes.
    pub async fn run(self, cancel: CancellationToken) {
        let renew_interval = Duration::from_millis((self.ttl_ms / 2).max(2_000));
        let mut consecutive_failures: u32 = 0;
        tracing::info!(
            "Leader elector started as {} (ttl {}ms, renew {:?})",
            self.instance_id,
            self.ttl_ms,
            renew_interval
        );

        loop {
            match self.tick().await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Leader election tick failed ({} consecutive): {:#}",
                        consecutive_failures,
                        e
                    );
                    if self.tx.borrow().is_leader {
                        self.demote("election tick failed");
                    }
                }
            }

            let delay = if consecutive_failures >= 10 {
                let exponent = (consecutive_failures - 10).min(5);
                renew_interval
                    .saturating_mul(1 << exponent)
                    .min(Duration::from_secs(30))
            } else {
                renew_interval
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        if self.tx.borrow().is_leader {
            self.demote("shutting down");
        }
        tracing::info!("Leader elector stopped");
    }

    async fn tick(&self) -> anyhow::Result<()> {
        if self.tx.borrow().is_leader {
            let extended = self
                .coord
                .extend_leader(keys::LEADER_KEY, &self.instance_id, self.ttl_ms)
                .await?;
            if extended {
                self.tx.send_modify(|state| state.last_renewal = Some(Utc::now()));
            } else {
                self.demote("lease renewal rejected");
            }
            return Ok(());
        }

        self.try_acquire().await
    }

    async fn try_acquire(&self) -> anyhow::Result<()> {
        if self
            .coord
            .set_nx_px(keys::LEADER_KEY, &self.instance_id, self.ttl_ms)
            .await?
        {
            self.promote();
            return Ok(());
        }

        // Lost the SET NX race, or the lease survived a previous run of
        // this same instance.
        match self.coord.get(keys::LEADER_KEY).await? {
            Some(holder) if holder == self.instance_id => self.promote(),
            Some(_) => {}
            None => {
                // Lease expired between the SET and the GET; retry now.
                if self
                    .coord
                    .set_nx_px(keys::LEADER_KEY, &self.instance_id, self.ttl_ms)
                    .await?
                {
                    self.promote();
                }
            }
        }
        Ok(())
    }

    fn promote(&self) {
        if !self.tx.borrow().is_leader {
            tracing::info!("Instance {} promoted to leader", self.instance_id);
        }
        self.tx.send_modify(|state| {
            state.is_leader = true;
            state.last_renewal = Some(Utc::now());
        });
    }

    fn demote(&self, reason: &str) {
        tracing::warn!("Instance {} demoted: {}", self.instance_id, reason);
        self.tx.send_modify(|state| state.is_leader = false);
    }

    /// Shutdown release: delete the lease only when it still carries this
    /// instance's id.
    pub async fn release(coord: &dyn CoordStore, instance_id: &str) {
        let holder = safe_run("get-leader", coord.get(keys::LEADER_KEY))
            .await
            .flatten();
        if holder.as_deref() == Some(instance_id) {
            safe_run("del-leader", coord.del(keys::LEADER_KEY)).await;
            tracing::info!("Released leadership for {}", instance_id);
        }
    }
}
