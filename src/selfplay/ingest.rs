//! Game ingestion: row budgets, file receipt, batched database flushes.
//!
//! Game rows accumulate in memory and are committed in one transaction on a
//! `flush` marker. The training manager is notified only after the commit,
//! so it never observes positions that are not yet durable.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::Transaction;
use tokio::net::tcp::OwnedReadHalf;

use super::{now_ns, SelfPlayManager};
use crate::ipc::{discard_payload, receive_payload_to_file, ClientConnection, MctsMetrics, Message};
use crate::{ClientId, ControlError, Generation};

/// Header fields of a `game` message; the file bytes follow on the socket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GameHeader {
    pub gen: Generation,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub rows: u64,
    pub flush: bool,
    pub done: bool,
    pub metrics: Option<MctsMetrics>,
}

/// One game row waiting for the next flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingGame {
    pub client_id: ClientId,
    pub gen: Generation,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub rows: u64,
}

impl SelfPlayManager {
    /// Whether `rows` more positions for `gen` fit under the budget.
    ///
    /// Gen 0 is exempt (the bootstrap has its own quota), as is any run
    /// without a configured cap. A batch that would push the recorded
    /// cumulative count past the cap is discarded whole.
    fn check_row_budget(&self, gen: Generation, rows: u64) -> bool {
        let Some(cap) = self.max_positions_per_generation else {
            return true;
        };
        if gen == 0 {
            return true;
        }
        let mut budget = self.budget.lock();
        let cumulative = budget.entry(gen).or_insert(0);
        if *cumulative + rows > cap {
            return false;
        }
        *cumulative += rows;
        true
    }

    /// Receive one game (header + file payload) from a worker.
    pub(crate) async fn handle_game(
        &self,
        conn: &Arc<ClientConnection>,
        reader: &mut OwnedReadHalf,
        header: GameHeader,
    ) -> Result<(), ControlError> {
        let use_data = self.check_row_budget(header.gen, header.rows);

        if use_data {
            let path =
                self.organizer
                    .game_file_path(conn.client_id, header.gen, header.end_timestamp);
            receive_payload_to_file(reader, &path).await?;
            self.pending.lock().push(PendingGame {
                client_id: conn.client_id,
                gen: header.gen,
                start_timestamp: header.start_timestamp,
                end_timestamp: header.end_timestamp,
                rows: header.rows,
            });
        } else {
            // Over budget: the bytes still have to come off the socket.
            discard_payload(reader).await?;
            crate::telemetry::record_positions_discarded(header.rows);
            tracing::debug!(
                %conn,
                gen = header.gen,
                rows = header.rows,
                "row budget exceeded; game discarded"
            );
        }

        if header.flush {
            let metrics = header
                .metrics
                .map(|m| (header.gen, header.end_timestamp, m));
            self.flush_pending(conn, metrics)?;
        }

        if header.done {
            tracing::info!(%conn, "client has finished self-play");
            conn.send(&Message::Quit).await?;
        }
        Ok(())
    }

    /// Standalone metrics report: flushes pending games in the same
    /// transaction, mirroring the flush path.
    pub(crate) fn record_metrics(
        &self,
        conn: &Arc<ClientConnection>,
        gen: Generation,
        timestamp: i64,
        metrics: &MctsMetrics,
    ) -> Result<(), ControlError> {
        self.flush_pending(conn, Some((gen, timestamp, *metrics)))?;
        Ok(())
    }

    /// Commit all pending game rows (plus optional metrics) in one write
    /// transaction, then wake the training manager.
    ///
    /// Returns the number of augmented positions committed.
    pub(crate) fn flush_pending(
        &self,
        conn: &Arc<ClientConnection>,
        metrics: Option<(Generation, i64, MctsMetrics)>,
    ) -> Result<u64, ControlError> {
        let pending: Vec<PendingGame> = {
            let mut guard = self.pending.lock();
            std::mem::take(&mut *guard)
        };
        if pending.is_empty() && metrics.is_none() {
            return Ok(0);
        }

        // Runtime accrued since the last flush is charged to the generation
        // this worker is currently producing.
        let (conn_gen, runtime) = conn.take_runtime_charge(now_ns());

        let mut per_gen: BTreeMap<Generation, (u64, u64)> = BTreeMap::new();
        let mut total_positions = 0u64;
        for game in &pending {
            let entry = per_gen.entry(game.gen).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += game.rows;
            total_positions += game.rows;
        }

        let client_id = conn.client_id;
        self.dbs.self_play.with_txn(|txn| {
            for (&gen, &(n_games, n_positions)) in &per_gen {
                let gen_runtime = if conn_gen == Some(gen) { runtime } else { 0 };
                upsert_metadata(txn, gen, n_games, n_positions, gen_runtime)?;
            }
            for game in &pending {
                txn.execute(
                    "INSERT INTO games (client_id, gen, start_timestamp, end_timestamp, \
                     augmented_positions) VALUES (?1, ?2, ?3, ?4, ?5)",
                    (
                        game.client_id,
                        game.gen,
                        game.start_timestamp,
                        game.end_timestamp,
                        game.rows as i64,
                    ),
                )?;
            }
            if let Some((gen, timestamp, m)) = &metrics {
                insert_metrics(txn, client_id, *gen, *timestamp, m)?;
            }
            Ok(())
        })?;

        crate::telemetry::record_games_ingested(pending.len() as u64, total_positions);
        // Notify strictly after the commit.
        self.positions_notify.notify_waiters();
        Ok(total_positions)
    }
}

fn upsert_metadata(
    txn: &Transaction,
    gen: Generation,
    n_games: u64,
    n_positions: u64,
    runtime: i64,
) -> rusqlite::Result<()> {
    txn.execute(
        "INSERT OR IGNORE INTO self_play_metadata (gen) VALUES (?1)",
        (gen,),
    )?;
    txn.execute(
        "UPDATE self_play_metadata SET games = games + ?1, \
         augmented_positions = augmented_positions + ?2, runtime = runtime + ?3 \
         WHERE gen = ?4",
        (n_games as i64, n_positions as i64, runtime, gen),
    )?;
    Ok(())
}

fn insert_metrics(
    txn: &Transaction,
    client_id: ClientId,
    gen: Generation,
    timestamp: i64,
    m: &MctsMetrics,
) -> rusqlite::Result<()> {
    txn.execute(
        "INSERT INTO metrics (client_id, gen, report_timestamp, cache_hits, cache_misses, \
         positions_evaluated, batches_evaluated, full_batches_evaluated) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            client_id,
            gen,
            timestamp,
            m.cache_hits as i64,
            m.cache_misses as i64,
            m.positions_evaluated as i64,
            m.batches_evaluated as i64,
            m.full_batches_evaluated as i64,
        ),
    )?;
    txn.execute(
        "INSERT OR IGNORE INTO self_play_metadata (gen) VALUES (?1)",
        (gen,),
    )?;
    txn.execute(
        "UPDATE self_play_metadata SET positions_evaluated = positions_evaluated + ?1, \
         batches_evaluated = batches_evaluated + ?2 WHERE gen = ?3",
        (m.positions_evaluated as i64, m.batches_evaluated as i64, gen),
    )?;
    Ok(())
}
