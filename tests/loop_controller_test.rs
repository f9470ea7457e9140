// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! End-to-end control-plane tests: a fresh run bootstraps gen-0, ingests
//! games over the real TCP protocol, trains gen-1, and starts steady-state
//! self-play.

mod common;

use std::time::Duration;

use arcade_loop::ipc::{ClientRole, Message};
use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_start_runs_gen0_and_trains_gen1() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, controller) = start_controller(dir.path(), 200, None).await;

    // Self-play server arrives and announces readiness.
    let (mut server, _server_id) =
        connect(addr, ClientRole::SelfPlayServer, "cuda:0", None).await;
    send(&mut server, &Message::Ready).await;
    match recv(&mut server).await {
        Message::StartGen0 { max_rows } => assert_eq!(max_rows, 200),
        other => panic!("expected start-gen0, got {other:?}"),
    }

    // Its worker streams two games that together meet the quota.
    let (mut worker, worker_id) =
        connect(addr, ClientRole::SelfPlayWorker, "cuda:0", None).await;
    send_game(&mut worker, 0, 10, 20, 120, false, false, b"game-1").await;
    send_game(&mut worker, 0, 20, 30, 80, true, false, b"game-2").await;

    // The flush is durable before the server may declare completion.
    wait_for_game_rows(&dir.path().join("self_play.db"), 2).await;
    send(&mut server, &Message::Gen0Complete).await;

    // Gen-1 training commits, then steady-state self-play starts.
    match recv(&mut server).await {
        Message::Start => {}
        other => panic!("expected start, got {other:?}"),
    }
    let organizer = controller.organizer();
    assert!(organizer.model_path(1).is_file());
    assert!(organizer.checkpoint_path(1).is_file());
    assert!(organizer.player_path(1).is_file());
    assert_eq!(organizer.latest_generation(), 1);

    // Game files landed under the per-client directory.
    assert!(organizer.game_file_path(worker_id, 0, 20).is_file());
    assert!(organizer.game_file_path(worker_id, 0, 30).is_file());

    // Aggregates match the per-game rows.
    let conn = rusqlite::Connection::open(dir.path().join("self_play.db")).unwrap();
    let (games, positions): (i64, i64) = conn
        .query_row(
            "SELECT games, augmented_positions FROM self_play_metadata WHERE gen = 0",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(games, 2);
    assert_eq!(positions, 200);
    let sum: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(augmented_positions), 0) FROM games WHERE gen = 0",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(sum, positions);

    // Training stats were recorded per head.
    let tconn = rusqlite::Connection::open(dir.path().join("training.db")).unwrap();
    let heads: i64 = tconn
        .query_row(
            "SELECT COUNT(*) FROM training_heads WHERE gen = 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(heads, 2);

    assert!(!controller.shutdown_manager().is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_after_committed_generations_skips_gen0() {
    let dir = tempfile::tempdir().unwrap();

    // A previous run left three committed generations behind.
    {
        let organizer = arcade_loop::organizer::DirectoryOrganizer::new(dir.path());
        organizer.makedirs().unwrap();
        for g in 1..=3u32 {
            std::fs::write(organizer.model_path(g), format!("weights-{g}")).unwrap();
            std::fs::write(organizer.player_path(g), format!("player-{g}")).unwrap();
        }
        let conn = rusqlite::Connection::open(organizer.self_play_db_path()).unwrap();
        for stmt in arcade_loop::db::schema::SELF_PLAY {
            conn.execute(stmt, []).unwrap();
        }
        conn.execute(
            "INSERT INTO self_play_metadata (gen, games, augmented_positions) \
             VALUES (3, 10, 5000)",
            [],
        )
        .unwrap();
    }

    let (addr, controller) = start_controller(dir.path(), 100_000, None).await;

    // No gen-0 work is requested; the server goes straight to steady state.
    let (mut server, _) = connect(addr, ClientRole::SelfPlayServer, "cuda:0", None).await;
    send(&mut server, &Message::Ready).await;
    match recv(&mut server).await {
        Message::Start => {}
        other => panic!("expected start, got {other:?}"),
    }
    assert_eq!(controller.organizer().latest_generation(), 3);
    assert!(!controller.shutdown_manager().is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn row_budget_discards_overflowing_game() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, controller) = start_controller(dir.path(), 100_000, Some(500)).await;

    let (mut worker, worker_id) =
        connect(addr, ClientRole::SelfPlayWorker, "cuda:0", None).await;

    // Two 300-row games against the same generation: the second would
    // exceed the 500-row cap.
    send_game(&mut worker, 1, 10, 20, 300, true, false, b"kept").await;
    wait_for_game_rows(&dir.path().join("self_play.db"), 1).await;
    send_game(&mut worker, 1, 30, 40, 300, true, false, b"dropped").await;

    // The discarded game's bytes were consumed: the socket stays usable.
    send(&mut worker, &Message::Metrics {
        gen: 1,
        timestamp: 50,
        metrics: arcade_loop::ipc::MctsMetrics {
            cache_hits: 1,
            cache_misses: 2,
            positions_evaluated: 3,
            batches_evaluated: 4,
            full_batches_evaluated: 5,
        },
    })
    .await;

    let organizer = controller.organizer();
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let count = rusqlite::Connection::open(dir.path().join("self_play.db"))
            .and_then(|c| c.query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get::<_, i64>(0)))
            .unwrap_or(0);
        if count >= 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "metrics never landed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(organizer.game_file_path(worker_id, 1, 20).is_file());
    assert!(!organizer.game_file_path(worker_id, 1, 40).exists());

    let conn = rusqlite::Connection::open(dir.path().join("self_play.db")).unwrap();
    let positions: i64 = conn
        .query_row(
            "SELECT augmented_positions FROM self_play_metadata WHERE gen = 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(positions, 300);
    let games: i64 = conn
        .query_row("SELECT COUNT(*) FROM games", [], |r| r.get(0))
        .unwrap();
    assert_eq!(games, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_sample_window_still_commits_gen1() {
    let dir = tempfile::tempdir().unwrap();
    let (_addr, controller) = start_controller(dir.path(), 0, None).await;

    // Gen-0 completes immediately with no positions; gen-1 training still
    // commits deterministically.
    let organizer = controller.organizer();
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !organizer.model_path(1).is_file() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "gen-1 model never committed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // And exactly gen-1: no runaway retraining on an empty history.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!organizer.model_path(2).exists());
    assert!(!controller.shutdown_manager().is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_done_is_answered_with_quit() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _controller) = start_controller(dir.path(), 100_000, None).await;

    let (mut worker, _) = connect(addr, ClientRole::SelfPlayWorker, "cuda:0", None).await;
    send_game(&mut worker, 0, 1, 2, 50, true, true, b"last-game").await;
    match recv(&mut worker).await {
        Message::Quit => {}
        other => panic!("expected quit, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gen0_owner_disconnect_passes_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _controller) = start_controller(dir.path(), 1000, None).await;

    // First server claims gen-0 and disconnects with no progress.
    let (mut first, _) = connect(addr, ClientRole::SelfPlayServer, "cuda:0", None).await;
    send(&mut first, &Message::Ready).await;
    match recv(&mut first).await {
        Message::StartGen0 { max_rows } => assert_eq!(max_rows, 1000),
        other => panic!("expected start-gen0, got {other:?}"),
    }
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A second server takes over the full remaining quota.
    let (mut second, _) = connect(addr, ClientRole::SelfPlayServer, "cuda:1", None).await;
    send(&mut second, &Message::Ready).await;
    match recv(&mut second).await {
        Message::StartGen0 { max_rows } => assert_eq!(max_rows, 1000),
        other => panic!("expected start-gen0, got {other:?}"),
    }
}
