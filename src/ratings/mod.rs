// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Rating-match scheduling and record keeping.
//!
//! Rating servers announce readiness; the manager hands out match-ups
//! against reference opponents, records the results, and - when no rating
//! work is making progress - elevates ratings priority on one GPU table so
//! the domain cannot be starved forever by self-play.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;

use crate::db::DatabaseManager;
use crate::gpu::{Domain, GpuContentionManager};
use crate::ipc::{
    spawn_recv_loop, ClientConnection, ConnectionRegistry, LoopFlow, MatchRecord, Message,
    RecvHandler,
};
use crate::shutdown::ShutdownManager;
use crate::{ClientId, ControlError, Generation};

/// Match scheduling knobs.
#[derive(Debug, Clone)]
pub struct RatingsParams {
    /// Games per assigned match.
    pub n_games_per_match: u32,
    /// Inclusive reference-strength search range.
    pub min_ref_strength: u32,
    pub max_ref_strength: u32,
    /// Hard cap on probe matches per generation. Bounds the search even on
    /// histories the bisection cannot narrow (a ratings client must never
    /// be consumed indefinitely by one generation).
    pub max_probes_per_gen: u32,
    /// Watchdog period for the starvation check.
    pub starvation_check_interval: Duration,
}

impl Default for RatingsParams {
    fn default() -> Self {
        Self {
            n_games_per_match: 100,
            min_ref_strength: 1,
            max_ref_strength: 21,
            max_probes_per_gen: 8,
            starvation_check_interval: Duration::from_secs(30),
        }
    }
}

/// Next match to play for some generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// Play against this strength next.
    Assign(u32),
    /// Search settled at this strength; the gen is rated.
    Converged(u32),
}

/// Replay a generation's match history `(strength, wins, losses)` as a
/// bisection of the inclusive strength range `[min, max]`.
///
/// A decisive match halves the bracket towards the strength where the
/// generation scores even; a drawn match, an emptied bracket, or the probe
/// cap settles the rating at the last probed strength. Every decisive match
/// shrinks the bracket, so the search ends within `log2(max - min)` probes
/// on any self-consistent history, and within `cap` probes on any history
/// at all.
fn bisect_history(history: &[(u32, u32, u32)], min: u32, max: u32, cap: u32) -> Probe {
    if let Some(&(last, _, _)) = history.last() {
        if history.len() as u64 >= u64::from(cap) {
            return Probe::Converged(last);
        }
    }
    let (mut lo, mut hi) = (i64::from(min), i64::from(max));
    for &(strength, wins, losses) in history {
        let s = i64::from(strength);
        if wins == losses {
            return Probe::Converged(strength);
        }
        if wins > losses {
            lo = lo.max(s + 1);
        } else {
            hi = hi.min(s - 1);
        }
        if lo > hi {
            return Probe::Converged(strength);
        }
    }
    Probe::Assign((lo + (hi - lo) / 2) as u32)
}

#[derive(Default)]
struct RatingsState {
    /// Server client id -> generation currently being rated by it.
    in_flight: HashMap<ClientId, Generation>,
    /// Servers that asked for work when none was available.
    idle_servers: Vec<Arc<ClientConnection>>,
}

/// Coordinates all rating servers and workers.
pub struct RatingsManager {
    organizer: Arc<crate::organizer::DirectoryOrganizer>,
    dbs: Arc<DatabaseManager>,
    gpus: Arc<GpuContentionManager>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownManager>,
    params: RatingsParams,
    latest_gen: watch::Receiver<Generation>,
    state: Mutex<RatingsState>,
}

impl RatingsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organizer: Arc<crate::organizer::DirectoryOrganizer>,
        dbs: Arc<DatabaseManager>,
        gpus: Arc<GpuContentionManager>,
        registry: Arc<ConnectionRegistry>,
        shutdown: Arc<ShutdownManager>,
        params: RatingsParams,
        latest_gen: watch::Receiver<Generation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            organizer,
            dbs,
            gpus,
            registry,
            shutdown,
            params,
            latest_gen,
            state: Mutex::new(RatingsState::default()),
        })
    }

    pub fn add_server(self: &Arc<Self>, conn: Arc<ClientConnection>, reader: OwnedReadHalf) {
        spawn_recv_loop(
            conn,
            reader,
            Arc::new(ServerHandler(self.clone())),
            self.registry.clone(),
            self.shutdown.clone(),
        );
    }

    pub fn add_worker(self: &Arc<Self>, conn: Arc<ClientConnection>, reader: OwnedReadHalf) {
        spawn_recv_loop(
            conn,
            reader,
            Arc::new(WorkerHandler(self.clone())),
            self.registry.clone(),
            self.shutdown.clone(),
        );
    }

    /// Background tasks: the starvation watchdog and the new-generation
    /// dispatcher for parked servers.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        let token = self.shutdown.token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.params.starvation_check_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => manager.starvation_check(),
                }
            }
        });

        let manager = self.clone();
        let token = self.shutdown.token();
        let mut latest = self.latest_gen.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = latest.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        manager.dispatch_idle_servers().await;
                    }
                }
            }
        });
    }

    /// Elevate ratings priority when workers exist but none holds a lock.
    fn starvation_check(&self) {
        let has_workers = !self
            .registry
            .by_role(crate::ipc::ClientRole::RatingsWorker)
            .is_empty();
        let has_work = !self.state.lock().in_flight.is_empty();
        if has_workers && has_work && !self.gpus.any_lock_held_by(Domain::Ratings) {
            tracing::debug!("no rating progress detected; elevating ratings priority");
            self.gpus.set_ratings_priority(true);
        }
    }

    /// Hand queued work to servers that were parked with nothing to do.
    async fn dispatch_idle_servers(&self) {
        let idle = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.idle_servers)
        };
        for conn in idle {
            if conn.is_closed() {
                continue;
            }
            if let Err(e) = self.handle_ready(&conn).await {
                tracing::warn!(%conn, error = %e, "failed to dispatch parked rating server");
            }
        }
    }

    // ---- match selection ----

    /// Pick the next `(gen, strength)` to rate, preferring the lowest
    /// generation without a converged rating.
    fn next_assignment(&self) -> Result<Option<(Generation, u32)>, ControlError> {
        let latest = *self.latest_gen.borrow();
        if latest < 1 {
            return Ok(None);
        }

        let in_flight: HashSet<Generation> =
            self.state.lock().in_flight.values().copied().collect();
        let rated: HashSet<Generation> = self.dbs.ratings.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT mcts_gen FROM ratings")?;
            let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
            rows.collect::<rusqlite::Result<HashSet<_>>>()
        })?;

        for gen in 1..=latest {
            if rated.contains(&gen) || in_flight.contains(&gen) {
                continue;
            }
            match self.probe_strength(gen)? {
                Probe::Assign(strength) => return Ok(Some((gen, strength))),
                Probe::Converged(strength) => {
                    self.commit_rating(gen, strength)?;
                }
            }
        }
        Ok(None)
    }

    /// Strength to probe next for `gen`, bisecting the configured range
    /// over the generation's recorded matches. Replayed from the database
    /// so a restart resumes the search where it left off.
    fn probe_strength(&self, gen: Generation) -> Result<Probe, ControlError> {
        let history: Vec<(u32, u32, u32)> = self.dbs.ratings.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ref_strength, wins, losses FROM matches \
                 WHERE mcts_gen = ?1 ORDER BY id",
            )?;
            let rows =
                stmt.query_map((gen,), |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect()
        })?;

        Ok(bisect_history(
            &history,
            self.params.min_ref_strength,
            self.params.max_ref_strength,
            self.params.max_probes_per_gen,
        ))
    }

    fn commit_rating(&self, gen: Generation, strength: u32) -> Result<(), ControlError> {
        let n_games: i64 = self.dbs.ratings.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(n_games), 0) FROM matches WHERE mcts_gen = ?1",
                (gen,),
                |row| row.get(0),
            )
        })?;
        self.dbs.ratings.with_txn(|txn| {
            txn.execute(
                "INSERT OR REPLACE INTO ratings (mcts_gen, n_games, rating) VALUES (?1, ?2, ?3)",
                (gen, n_games, f64::from(strength)),
            )?;
            Ok(())
        })?;
        tracing::info!(gen, strength, "generation rated");
        Ok(())
    }

    async fn handle_ready(&self, conn: &Arc<ClientConnection>) -> Result<(), ControlError> {
        match self.next_assignment()? {
            Some((gen, strength)) => {
                self.state.lock().in_flight.insert(conn.client_id, gen);
                tracing::info!(%conn, gen, strength, "assigning rating match");
                conn.send(&Message::MatchRequest {
                    mcts_gen: gen,
                    ref_strength: strength,
                    n_games: self.params.n_games_per_match,
                })
                .await?;
            }
            None => {
                tracing::debug!(%conn, "no rating work available; parking server");
                self.state.lock().idle_servers.push(conn.clone());
            }
        }
        Ok(())
    }

    fn handle_match_result(
        &self,
        conn: &Arc<ClientConnection>,
        record: &MatchRecord,
        mcts_gen: Generation,
        ref_strength: u32,
    ) -> Result<(), ControlError> {
        self.dbs.ratings.with_txn(|txn| {
            txn.execute(
                "INSERT INTO matches (mcts_gen, ref_strength, n_games, wins, draws, losses) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    mcts_gen,
                    ref_strength,
                    record.n_games(),
                    record.wins,
                    record.draws,
                    record.losses,
                ),
            )?;
            Ok(())
        })?;
        self.state.lock().in_flight.remove(&conn.client_id);
        crate::telemetry::record_match_recorded();
        tracing::info!(
            %conn,
            mcts_gen,
            ref_strength,
            wins = record.wins,
            draws = record.draws,
            losses = record.losses,
            "match recorded"
        );
        // Progress was made; drop any elevation until starvation recurs.
        self.gpus.set_ratings_priority(false);
        Ok(())
    }

    fn handle_server_disconnect(&self, conn: &Arc<ClientConnection>) {
        let mut state = self.state.lock();
        state.in_flight.remove(&conn.client_id);
        state.idle_servers.retain(|c| c.client_id != conn.client_id);
    }

    /// Abandon the current match and let the server re-announce readiness.
    fn handle_worker_exit(&self, conn: &Arc<ClientConnection>, src: &str) {
        tracing::warn!(%conn, src, "rating worker exited; abandoning match");
        self.state.lock().in_flight.remove(&conn.client_id);
    }

    async fn send_weights(
        &self,
        conn: &Arc<ClientConnection>,
        gen: Generation,
    ) -> Result<(), ControlError> {
        let path = self.organizer.model_path(gen);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            ControlError::Invariant(format!(
                "model artifact for generation {gen} unreadable at {}: {e}",
                path.display()
            ))
        })?;
        conn.send_with_payload(&Message::ReloadWeights { generation: gen }, &bytes)
            .await?;
        conn.set_sent_gen(gen);
        Ok(())
    }

    /// Wait for in-flight matches to finish, up to `timeout`. Rating
    /// workers get to complete their current match during teardown.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state.lock().in_flight.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::warn!("rating matches still in flight at teardown deadline");
    }

    pub fn status_dump(&self) {
        let state = self.state.lock();
        tracing::info!(
            in_flight = ?state.in_flight,
            idle_servers = state.idle_servers.len(),
            "ratings state"
        );
    }
}

/// Receive-loop handler for rating servers.
struct ServerHandler(Arc<RatingsManager>);

#[async_trait]
impl RecvHandler for ServerHandler {
    async fn handle(
        &self,
        conn: &Arc<ClientConnection>,
        msg: Message,
        _reader: &mut OwnedReadHalf,
    ) -> Result<LoopFlow, ControlError> {
        match msg {
            Message::Log { line, src } => {
                tracing::info!(client = conn.client_id, src = src.as_deref().unwrap_or("-"), "{line}");
            }
            Message::Ready => self.0.handle_ready(conn).await?,
            Message::MatchResult {
                record,
                mcts_gen,
                ref_strength,
            } => self.0.handle_match_result(conn, &record, mcts_gen, ref_strength)?,
            Message::WorkerExit { src, .. } => self.0.handle_worker_exit(conn, &src),
            Message::Done => return Ok(LoopFlow::Terminate),
            other => {
                tracing::warn!(%conn, kind = other.kind(), "unexpected ratings-server message");
            }
        }
        Ok(LoopFlow::Continue)
    }

    async fn on_disconnect(&self, conn: &Arc<ClientConnection>) {
        self.0.handle_server_disconnect(conn);
    }
}

/// Receive-loop handler for rating workers.
///
/// A rating worker pins the generation its match was assigned for, holds the
/// ratings lock on its GPU for the duration of the match, and is allowed to
/// finish the match during shutdown.
struct WorkerHandler(Arc<RatingsManager>);

#[async_trait]
impl RecvHandler for WorkerHandler {
    async fn handle(
        &self,
        conn: &Arc<ClientConnection>,
        msg: Message,
        _reader: &mut OwnedReadHalf,
    ) -> Result<LoopFlow, ControlError> {
        match msg {
            Message::Log { line, src } => {
                tracing::debug!(client = conn.client_id, src = src.as_deref().unwrap_or("-"), "{line}");
            }
            Message::WeightsRequest { generation } => {
                let gen = generation.unwrap_or_else(|| *self.0.latest_gen.borrow());
                let table = self.0.gpus.table(&conn.gpu_id);
                table.activate(Domain::Ratings);
                if !table.acquire_lock(Domain::Ratings).await {
                    return Ok(LoopFlow::Terminate);
                }
                self.0.send_weights(conn, gen).await?;
            }
            Message::Done => return Ok(LoopFlow::Terminate),
            other => {
                tracing::warn!(%conn, kind = other.kind(), "unexpected ratings-worker message");
            }
        }
        Ok(LoopFlow::Continue)
    }

    async fn on_disconnect(&self, conn: &Arc<ClientConnection>) {
        // Releases the match lock if the worker still held it.
        self.0.gpus.table(&conn.gpu_id).deactivate(Domain::Ratings);
    }
}
