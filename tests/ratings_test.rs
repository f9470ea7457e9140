// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Rating server scheduling: ready/match-request cycles, the strength
//! probe, and rated-generation bookkeeping.

mod common;

use std::time::Duration;

use arcade_loop::ipc::{ClientRole, MatchRecord, Message};
use common::*;

/// Seed a run that already committed gen-1 so rating work exists.
fn seed_gen1(dir: &std::path::Path) {
    let organizer = arcade_loop::organizer::DirectoryOrganizer::new(dir);
    organizer.makedirs().unwrap();
    std::fs::write(organizer.model_path(1), "weights-1").unwrap();
    std::fs::write(organizer.player_path(1), "player-1").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ready_cycle_probes_strength_until_convergence() {
    let dir = tempfile::tempdir().unwrap();
    seed_gen1(dir.path());
    let (addr, controller) = start_controller(dir.path(), 100_000, None).await;

    let (mut server, _) = connect(addr, ClientRole::RatingsServer, "cuda:1", None).await;

    // First probe starts at the middle of the strength range.
    send(&mut server, &Message::Ready).await;
    let first = match recv(&mut server).await {
        Message::MatchRequest {
            mcts_gen,
            ref_strength,
            n_games,
        } => {
            assert_eq!(mcts_gen, 1);
            assert_eq!(n_games, 100);
            ref_strength
        }
        other => panic!("expected match-request, got {other:?}"),
    };
    assert_eq!(first, 11);

    // A win bisects into the upper half of the bracket: [12, 21] -> 16.
    send(
        &mut server,
        &Message::MatchResult {
            record: MatchRecord {
                wins: 60,
                draws: 0,
                losses: 40,
            },
            mcts_gen: 1,
            ref_strength: first,
        },
    )
    .await;
    send(&mut server, &Message::Ready).await;
    let second = match recv(&mut server).await {
        Message::MatchRequest { ref_strength, .. } => ref_strength,
        other => panic!("expected match-request, got {other:?}"),
    };
    assert_eq!(second, 16);

    // An even score converges the probe; the generation is rated and no
    // further work is assigned.
    send(
        &mut server,
        &Message::MatchResult {
            record: MatchRecord {
                wins: 50,
                draws: 0,
                losses: 50,
            },
            mcts_gen: 1,
            ref_strength: second,
        },
    )
    .await;
    send(&mut server, &Message::Ready).await;
    expect_silence(&mut server, Duration::from_millis(300)).await;

    let conn = rusqlite::Connection::open(dir.path().join("ratings.db")).unwrap();
    let matches: i64 = conn
        .query_row("SELECT COUNT(*) FROM matches WHERE mcts_gen = 1", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(matches, 2);
    let (rated_games, rating): (i64, f64) = conn
        .query_row(
            "SELECT n_games, rating FROM ratings WHERE mcts_gen = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(rated_games, 200);
    assert_eq!(rating, f64::from(second));

    assert!(!controller.shutdown_manager().is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oscillating_results_still_settle_the_rating() {
    let dir = tempfile::tempdir().unwrap();
    seed_gen1(dir.path());
    let (addr, controller) = start_controller(dir.path(), 100_000, None).await;

    let (mut server, _) = connect(addr, ClientRole::RatingsServer, "cuda:1", None).await;

    // A generation whose true strength sits between two integer levels
    // never draws: it wins below and loses above, alternating forever.
    // The bracket still empties after four matches.
    let script = [
        (11u32, 60u32, 40u32),
        (16, 40, 60),
        (13, 60, 40),
        (14, 40, 60),
    ];
    for (expected_strength, wins, losses) in script {
        send(&mut server, &Message::Ready).await;
        match recv(&mut server).await {
            Message::MatchRequest { ref_strength, .. } => {
                assert_eq!(ref_strength, expected_strength);
            }
            other => panic!("expected match-request, got {other:?}"),
        }
        send(
            &mut server,
            &Message::MatchResult {
                record: MatchRecord {
                    wins,
                    draws: 0,
                    losses,
                },
                mcts_gen: 1,
                ref_strength: expected_strength,
            },
        )
        .await;
    }

    // No fifth match: the generation is rated at the emptied bracket.
    send(&mut server, &Message::Ready).await;
    expect_silence(&mut server, Duration::from_millis(300)).await;

    let conn = rusqlite::Connection::open(dir.path().join("ratings.db")).unwrap();
    let matches: i64 = conn
        .query_row("SELECT COUNT(*) FROM matches WHERE mcts_gen = 1", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(matches, 4);
    let rating: f64 = conn
        .query_row("SELECT rating FROM ratings WHERE mcts_gen = 1", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(rating, 14.0);

    assert!(!controller.shutdown_manager().is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probe_cap_retires_a_generation_with_inconsistent_history() {
    let dir = tempfile::tempdir().unwrap();
    seed_gen1(dir.path());

    // A previous run recorded eight decisive matches pinned at the same
    // strength (the default probe cap); the search must end rather than
    // assign a ninth match.
    {
        let conn = rusqlite::Connection::open(dir.path().join("ratings.db")).unwrap();
        for stmt in arcade_loop::db::schema::RATINGS {
            conn.execute(stmt, []).unwrap();
        }
        for _ in 0..8 {
            conn.execute(
                "INSERT INTO matches (mcts_gen, ref_strength, n_games, wins, draws, losses) \
                 VALUES (1, 11, 100, 60, 0, 40)",
                [],
            )
            .unwrap();
        }
    }

    let (addr, _controller) = start_controller(dir.path(), 100_000, None).await;
    let (mut server, _) = connect(addr, ClientRole::RatingsServer, "cuda:1", None).await;

    send(&mut server, &Message::Ready).await;
    expect_silence(&mut server, Duration::from_millis(300)).await;

    let conn = rusqlite::Connection::open(dir.path().join("ratings.db")).unwrap();
    let rating: f64 = conn
        .query_row("SELECT rating FROM ratings WHERE mcts_gen = 1", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(rating, 11.0);
    let matches: i64 = conn
        .query_row("SELECT COUNT(*) FROM matches", [], |r| r.get(0))
        .unwrap();
    assert_eq!(matches, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rating_worker_receives_pinned_generation_weights() {
    let dir = tempfile::tempdir().unwrap();
    seed_gen1(dir.path());
    let (addr, _controller) = start_controller(dir.path(), 100_000, None).await;

    let (mut worker, _) = connect(addr, ClientRole::RatingsWorker, "cuda:1", None).await;
    send(&mut worker, &Message::WeightsRequest { generation: Some(1) }).await;

    match recv(&mut worker).await {
        Message::ReloadWeights { generation } => assert_eq!(generation, 1),
        other => panic!("expected reload-weights, got {other:?}"),
    }
    let payload = tokio::time::timeout(
        RECV_TIMEOUT,
        arcade_loop::ipc::read_payload(&mut worker),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(payload, b"weights-1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parked_server_gets_work_when_a_generation_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _controller) = start_controller(dir.path(), 100, None).await;

    // No committed generations yet: the server parks.
    let (mut ratings, _) = connect(addr, ClientRole::RatingsServer, "cuda:1", None).await;
    send(&mut ratings, &Message::Ready).await;
    expect_silence(&mut ratings, Duration::from_millis(200)).await;

    // Drive the run through gen-0 into a gen-1 commit.
    let (mut server, _) = connect(addr, ClientRole::SelfPlayServer, "cuda:0", None).await;
    send(&mut server, &Message::Ready).await;
    match recv(&mut server).await {
        Message::StartGen0 { .. } => {}
        other => panic!("expected start-gen0, got {other:?}"),
    }
    let (mut worker, _) = connect(addr, ClientRole::SelfPlayWorker, "cuda:0", None).await;
    send_game(&mut worker, 0, 1, 2, 100, true, false, b"game").await;
    wait_for_game_rows(&dir.path().join("self_play.db"), 1).await;
    send(&mut server, &Message::Gen0Complete).await;
    match recv(&mut server).await {
        Message::Start => {}
        other => panic!("expected start, got {other:?}"),
    }

    // The committed generation wakes the parked rating server.
    match recv(&mut ratings).await {
        Message::MatchRequest { mcts_gen, .. } => assert_eq!(mcts_gen, 1),
        other => panic!("expected match-request, got {other:?}"),
    }
}
