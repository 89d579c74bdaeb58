//! Reconciliation loop scenarios: cold start, surge pressure, stale-API
//! degradation, excess withdrawal, and takeover behavior.

mod support;

use botfleet_controller::{pruner, Reconciler};
use botfleet_coord::CoordStore;
use botfleet_core::keys;
use std::collections::HashSet;
use support::{harness, harness_with, FakeGameApi};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn cold_start_deploys_the_minimum() {
    let h = harness(10);

    // Leader promotion seeds the rotation queue from the directory.
    let recovered = pruner::recover_limbo_bots(&h.ctl).await;
    assert_eq!(recovered, 10);

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
    assert_eq!(h.coord.scard(keys::ACTIVE_SET).await.unwrap(), 0);
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 5);

    // The rotation queue and the deployed set stay disjoint.
    let rotation: HashSet<String> = h
        .coord
        .lrange(keys::ROTATION_QUEUE, 0, -1)
        .await
        .unwrap()
        .into_iter()
        .collect();
    for bot_id in h.coord.smembers(keys::DEPLOYED_SET).await.unwrap() {
        assert!(!rotation.contains(&bot_id));
    }
}

#[tokio::test(start_paused = true)]
async fn waiting_human_triggers_a_surge_deploy() {
    let h = harness(10);
    for i in 1..=5 {
        h.coord
            .sadd(keys::DEPLOYED_SET, &format!("bot-{i}"))
            .await
            .unwrap();
    }
    for i in 6..=10 {
        h.coord
            .rpush(keys::ROTATION_QUEUE, &format!("bot-{i}"))
            .await
            .unwrap();
    }
    h.api.set_global(1, 15_001);

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 6);
}

#[tokio::test(start_paused = true)]
async fn no_surge_until_the_wait_crosses_the_threshold() {
    let h = harness(10);
    for i in 1..=5 {
        h.coord
            .sadd(keys::DEPLOYED_SET, &format!("bot-{i}"))
            .await
            .unwrap();
        // A healthy fleet member visibly waiting in the queue.
        h.coord
            .zadd(keys::QUEUE_ELO, &format!("bot-{i}"), 1200.0)
            .await;
    }
    h.api.set_global(1, 15_000);

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn stale_stats_top_up_to_minimum_but_never_surge() {
    let h = harness_with(10, FakeGameApi::stale());
    for i in 1..=3 {
        h.coord
            .sadd(keys::DEPLOYED_SET, &format!("bot-{i}"))
            .await
            .unwrap();
        h.coord
            .zadd(keys::QUEUE_ELO, &format!("bot-{i}"), 1200.0)
            .await;
    }
    for i in 4..=10 {
        h.coord
            .rpush(keys::ROTATION_QUEUE, &format!("bot-{i}"))
            .await
            .unwrap();
    }

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    // Topped up to the floor, not a bot beyond it.
    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn stale_stats_withdraw_idle_excess_only_down_to_minimum() {
    let h = harness_with(10, FakeGameApi::stale());
    for i in 1..=7 {
        h.coord
            .sadd(keys::DEPLOYED_SET, &format!("bot-{i}"))
            .await
            .unwrap();
    }

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn undeploy_spares_bots_with_visible_queue_presence() {
    let h = harness(10);
    for i in 1..=7 {
        h.coord
            .sadd(keys::DEPLOYED_SET, &format!("bot-{i}"))
            .await
            .unwrap();
    }
    // bot-1 holds a seat reservation, bot-2 is enrolled in the queue.
    h.coord
        .set(&keys::reservation_key("bot-1"), "{}")
        .await
        .unwrap();
    h.coord.zadd(keys::QUEUE_ELO, "bot-2", 1200.0).await;

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
    assert!(h.coord.sismember(keys::DEPLOYED_SET, "bot-1").await.unwrap());
    assert!(h.coord.sismember(keys::DEPLOYED_SET, "bot-2").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn empty_rotation_falls_back_to_limbo_recovery() {
    let h = harness(3);

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    // Only three bots exist; the rotation was re-seeded mid-tick and every
    // one of them was deployed.
    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 3);
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn takeover_tick_observes_existing_state_without_mutation() {
    let h = harness(10);
    // State left behind by a killed leader: five healthy deployed bots.
    for i in 1..=5 {
        let bot_id = format!("bot-{i}");
        h.coord.sadd(keys::DEPLOYED_SET, &bot_id).await.unwrap();
        h.coord
            .set_px(&keys::state_key(&bot_id), "queued", 3_600_000)
            .await
            .unwrap();
        h.coord.zadd(keys::QUEUE_ELO, &bot_id, 1200.0).await;
    }

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    let deployed: HashSet<String> = h
        .coord
        .smembers(keys::DEPLOYED_SET)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(deployed.len(), 5);
    for i in 1..=5 {
        assert!(deployed.contains(&format!("bot-{i}")));
    }
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn deployment_pause_blocks_the_batch() {
    let h = harness(10);
    pruner::recover_limbo_bots(&h.ctl).await;
    h.ctl.pause_deployments();

    let reconciler = Reconciler::new(h.ctl.clone(), CancellationToken::new());
    reconciler.run_once().await.unwrap();

    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 0);
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 10);

    h.ctl.resume_deployments();
    reconciler.run_once().await.unwrap();
    assert_eq!(h.coord.scard(keys::DEPLOYED_SET).await.unwrap(), 5);
}
