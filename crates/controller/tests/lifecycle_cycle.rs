//! End-to-end walks of the per-bot lifecycle against the scripted room
//! server: the happy queued→matched→playing→completed path, the recycle
//! paths, and the join retry policy.

mod support;

use botfleet_controller::LifecycleDriver;
use botfleet_coord::CoordStore;
use botfleet_core::keys;
use botfleet_gameserver::{MatchRoomEvent, QueueRoomEvent};
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{harness, wait_until};
use tokio_util::sync::CancellationToken;

async fn footprint_gone(coord: &botfleet_coord::MemoryCoord, bot_id: &str) -> bool {
    !coord.sismember(keys::ACTIVE_SET, bot_id).await.unwrap()
        && !coord.sismember(keys::DEPLOYED_SET, bot_id).await.unwrap()
        && !coord.sismember(keys::CYCLING_SET, bot_id).await.unwrap()
        && coord.get(&keys::state_key(bot_id)).await.unwrap().is_none()
        && coord
            .get(&keys::reservation_key(bot_id))
            .await
            .unwrap()
            .is_none()
        && coord
            .get(&keys::cycling_guard_key(bot_id))
            .await
            .unwrap()
            .is_none()
}

#[tokio::test(start_paused = true)]
async fn full_cycle_completes_and_releases_everything() {
    let h = harness(3);
    h.server.script_queue(vec![
        (10, QueueRoomEvent::Queued { position: 1 }),
        (
            900,
            QueueRoomEvent::MatchFound {
                room_id: "R1".to_string(),
                match_id: "M1".to_string(),
                problem_id: "P9".to_string(),
            },
        ),
    ]);
    h.server.script_match(vec![
        (10, MatchRoomEvent::Init),
        (50, MatchRoomEvent::CodeUpdate),
        (200, MatchRoomEvent::Closed),
    ]);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move { footprint_gone(&coord, "bot-1").await }
    })
    .await;

    // Queue membership was consumed during the handoff.
    assert!(h
        .coord
        .zscore(keys::QUEUE_ELO, "bot-1")
        .await
        .unwrap()
        .is_none());

    // The ordered handoff: join the match room first, only then leave the
    // queue room.
    let log = h.server.log_entries();
    let match_join = log.iter().position(|e| e == "match_join:R1:bot-1");
    let queue_leave = log.iter().position(|e| e == "leave:queue:bot-1");
    assert!(match_join.is_some(), "match room was never joined: {log:?}");
    assert!(queue_leave.is_some(), "queue room was never left: {log:?}");
    assert!(match_join.unwrap() < queue_leave.unwrap());

    // Completion must not re-enqueue the bot; rotation stays empty until
    // the game server publishes botMatchComplete.
    assert_eq!(h.coord.llen(keys::ROTATION_QUEUE).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn queue_room_error_recycles_exactly_once() {
    let h = harness(3);
    h.server.script_queue(vec![(
        10,
        QueueRoomEvent::Error {
            code: 5000,
            message: "room crashed".to_string(),
        },
    )]);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move { coord.llen(keys::ROTATION_QUEUE).await.unwrap() == 1 }
    })
    .await;

    let rotation = h.coord.lrange(keys::ROTATION_QUEUE, 0, -1).await.unwrap();
    assert_eq!(rotation, vec!["bot-1"]);
    assert!(footprint_gone(&h.coord, "bot-1").await);
}

#[tokio::test(start_paused = true)]
async fn reservation_expiry_is_retried_then_succeeds() {
    let h = harness(3);
    h.server.reject_joins.store(2, Ordering::SeqCst);
    h.server.script_queue(vec![(
        600,
        QueueRoomEvent::MatchFound {
            room_id: "R2".to_string(),
            match_id: "M2".to_string(),
            problem_id: "P1".to_string(),
        },
    )]);
    h.server.script_match(vec![(20, MatchRoomEvent::Closed)]);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move { footprint_gone(&coord, "bot-1").await }
    })
    .await;

    // Two rejections plus the accepted third attempt.
    assert_eq!(h.server.join_count.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn reservation_expiry_exhausts_retries_and_recycles() {
    let h = harness(3);
    h.server.reject_joins.store(5, Ordering::SeqCst);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move { coord.llen(keys::ROTATION_QUEUE).await.unwrap() == 1 }
    })
    .await;

    assert_eq!(h.server.join_count.load(Ordering::SeqCst), 5);
    assert!(footprint_gone(&h.coord, "bot-1").await);
}

#[tokio::test(start_paused = true)]
async fn match_wait_timeout_recycles() {
    let h = harness(3);
    // Only the enrollment ack; no duel ever arrives.
    h.server
        .script_queue(vec![(10, QueueRoomEvent::Queued { position: 4 })]);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move { coord.llen(keys::ROTATION_QUEUE).await.unwrap() == 1 }
    })
    .await;

    assert!(footprint_gone(&h.coord, "bot-1").await);
}

#[tokio::test(start_paused = true)]
async fn guard_blocks_concurrent_deploys_of_the_same_bot() {
    let h = harness(3);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    let first = driver
        .deploy("bot-1", Duration::from_millis(1_000))
        .await
        .unwrap();
    let second = driver
        .deploy("bot-1", Duration::from_millis(1_000))
        .await
        .unwrap();

    assert_eq!(first, botfleet_controller::DeployOutcome::Scheduled);
    assert_eq!(second, botfleet_controller::DeployOutcome::GuardHeld);
}

#[tokio::test(start_paused = true)]
async fn deploy_aborts_for_bot_already_in_match() {
    let h = harness(3);
    h.coord
        .set(&keys::current_match_key("bot-1"), "M7")
        .await
        .unwrap();

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    let outcome = driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    assert_eq!(outcome, botfleet_controller::DeployOutcome::AlreadyInMatch);
    // The abort released the guard and never asserted deployment.
    assert!(!h.coord.sismember(keys::DEPLOYED_SET, "bot-1").await.unwrap());
    assert!(h
        .coord
        .get(&keys::cycling_guard_key("bot-1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn deploy_of_unknown_bot_is_undone() {
    let h = harness(3);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    let outcome = driver
        .deploy("bot-99", Duration::from_millis(0))
        .await
        .unwrap();

    assert_eq!(outcome, botfleet_controller::DeployOutcome::MissingProfile);
    assert!(!h.coord.sismember(keys::DEPLOYED_SET, "bot-99").await.unwrap());
    assert!(!h.coord.sismember(keys::CYCLING_SET, "bot-99").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn missing_queue_membership_recycles() {
    let h = harness(3);
    h.server
        .script_queue(vec![(10, QueueRoomEvent::Queued { position: 1 })]);

    let driver = LifecycleDriver::new(h.ctl.clone(), CancellationToken::new());
    driver
        .deploy("bot-1", Duration::from_millis(0))
        .await
        .unwrap();

    // Simulate the game server silently dropping the enrollment while the
    // settle window runs.
    let coord = h.coord.clone();
    wait_until(|| {
        let coord = coord.clone();
        async move {
            coord
                .zscore(keys::QUEUE_ELO, "bot-1")
                .await
                .unwrap()
                .is_some()
        }
    })
    .await;
    h.coord.zrem(keys::QUEUE_ELO, "bot-1").await.unwrap();

    wait_until(|| {
        let coord = coord.clone();
        async move { coord.llen(keys::ROTATION_QUEUE).await.unwrap() == 1 }
    })
    .await;
    assert!(footprint_gone(&h.coord, "bot-1").await);
}
