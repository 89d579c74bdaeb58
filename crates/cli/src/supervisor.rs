use anyhow::{Context as _, Result};
use botfleet_controller::{
    pruner, CommandSubscriber, Controller, LeaderElector, LeaderState, Pruner, Reconciler,
};
use botfleet_coord::{CoordStore, RedisCoord};
use botfleet_core::AppConfig;
use botfleet_gameserver::{GameApi, GameServerClient, GameSocket, MatchServer};
use botfleet_registry::{BotDirectory, PgBotDirectory};
use botfleet_web_api::HealthServer;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process orchestration: wires the components in dependency order, reacts
/// to leadership edges, and owns the graceful shutdown sequence.
pub struct Supervisor;

impl Supervisor {
    /// Runs the controller until SIGINT/SIGTERM.
    ///
    /// # Errors
    /// Returns an error on fatal startup problems (bad config, unreachable
    /// coord store or registry); the process then exits with code 1.
    pub async fn run(config: AppConfig) -> Result<()> {
        config.validate().context("invalid configuration")?;
        let instance_id = config.controller.instance_id.clone();
        tracing::info!("Starting bot fleet controller as {}", instance_id);

        let coord: Arc<dyn CoordStore> = Arc::new(
            RedisCoord::connect(&config.coord)
                .await
                .context("coord store unavailable at startup")?,
        );
        let registry =
            PgBotDirectory::connect(&config.registry.url, config.registry.max_connections)
                .await
                .context("registry database unavailable at startup")?;
        let directory: Arc<dyn BotDirectory> = Arc::new(registry.clone());

        let game_client = Arc::new(GameServerClient::new(
            &config.game_server.base_url,
            config.game_server.bot_service_secret.clone(),
        )?);
        let breakers = game_client.breakers();
        let game_api: Arc<dyn GameApi> = game_client;
        let rooms: Arc<dyn MatchServer> = Arc::new(GameSocket::new(&config.game_server.base_url));

        let ctl = Arc::new(Controller::new(
            coord.clone(),
            game_api,
            rooms,
            directory,
            config.controller.clone(),
        ));

        let shutdown = CancellationToken::new();
        let (elector, leader_rx) =
            LeaderElector::new(coord.clone(), instance_id.clone(), config.controller.leader_ttl_ms);

        let health = HealthServer::new(coord.clone(), leader_rx.clone(), breakers);
        let health_cancel = shutdown.child_token();
        let health_port = config.health.port;
        let health_task = tokio::spawn(async move {
            if let Err(e) = health.serve(health_port, health_cancel).await {
                tracing::error!("Health listener failed: {:#}", e);
            }
        });

        let subscriber = CommandSubscriber::new(ctl.clone(), leader_rx.clone());
        let subscriber_task = tokio::spawn(subscriber.run(shutdown.child_token()));

        let elector_task = tokio::spawn(elector.run(shutdown.child_token()));

        let reactor_task = tokio::spawn(leadership_reactor(
            ctl.clone(),
            leader_rx,
            shutdown.child_token(),
        ));

        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");

        // Teardown order: stop the loops and the subscriber, release the
        // lease, then close the clients.
        shutdown.cancel();
        for task in [reactor_task, subscriber_task, elector_task, health_task] {
            let _ = task.await;
        }
        LeaderElector::release(&*coord, &instance_id).await;
        registry.close().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

/// Starts the reconciler and pruner on promotion and cancels them on
/// demotion. Demotion never touches shared state; the new leader takes
/// over observation of `bots:deployed` as-is.
async fn leadership_reactor(
    ctl: Arc<Controller>,
    mut leader_rx: watch::Receiver<LeaderState>,
    cancel: CancellationToken,
) {
    let mut leader_tasks: Option<(CancellationToken, Vec<JoinHandle<()>>)> = None;

    loop {
        let is_leader = leader_rx.borrow_and_update().is_leader;
        if is_leader && leader_tasks.is_none() {
            tracing::info!("Promoted: starting reconciliation and pruning");
            // Seed the rotation queue before the first tick so a cold
            // start has bots to deploy.
            pruner::recover_limbo_bots(&ctl).await;

            let token = cancel.child_token();
            let reconciler = Reconciler::new(ctl.clone(), token.child_token());
            let pruner_loop = Pruner::new(ctl.clone());
            let handles = vec![
                tokio::spawn(reconciler.run(token.child_token())),
                tokio::spawn(pruner_loop.run(token.child_token())),
            ];
            ctl.nudge_reconcile();
            leader_tasks = Some((token, handles));
        } else if !is_leader {
            if let Some((token, handles)) = leader_tasks.take() {
                tracing::info!("Demoted: stopping reconciliation and pruning");
                token.cancel();
                for handle in handles {
                    let _ = handle.await;
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            changed = leader_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((token, handles)) = leader_tasks.take() {
        token.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigterm = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = sigterm => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
