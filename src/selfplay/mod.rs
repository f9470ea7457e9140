// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Self-play coordination: gen-0 bootstrap, server lifecycle, worker
//! pause/unpause state machines, game ingestion and row budgets.
//!
//! Servers orchestrate the native self-play processes; workers are their
//! per-GPU children. Exactly one connected server owns the gen-0 bootstrap
//! at any time; every other server blocks until gen-0 is declared complete.

mod ingest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{watch, Notify};

use crate::db::DatabaseManager;
use crate::gpu::GpuContentionManager;
use crate::ipc::{
    spawn_recv_loop, ClientConnection, ConnectionRegistry, LoopFlow, Message, RecvHandler,
};
use crate::organizer::DirectoryOrganizer;
use crate::shutdown::ShutdownManager;
use crate::{ClientId, ControlError, Generation};

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct Gen0State {
    owner: Option<ClientId>,
    complete: bool,
}

/// Coordinates all self-play servers and workers.
pub struct SelfPlayManager {
    organizer: Arc<DirectoryOrganizer>,
    dbs: Arc<DatabaseManager>,
    gpus: Arc<GpuContentionManager>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownManager>,

    samples_per_window: u64,
    max_positions_per_generation: Option<u64>,
    restart_interval: Duration,

    gen0: Mutex<Gen0State>,
    gen0_notify: Notify,

    retrain_tx: watch::Sender<bool>,
    latest_gen: watch::Receiver<Generation>,

    /// Cumulative rows offered per generation, for the budget check.
    budget: Mutex<HashMap<Generation, u64>>,
    /// Game rows received but not yet committed.
    pending: Mutex<Vec<ingest::PendingGame>>,
    /// Fired after every committed flush; the training manager listens.
    positions_notify: Arc<Notify>,
}

impl SelfPlayManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organizer: Arc<DirectoryOrganizer>,
        dbs: Arc<DatabaseManager>,
        gpus: Arc<GpuContentionManager>,
        registry: Arc<ConnectionRegistry>,
        shutdown: Arc<ShutdownManager>,
        samples_per_window: u64,
        max_positions_per_generation: Option<u64>,
        restart_interval: Duration,
        latest_gen: watch::Receiver<Generation>,
        positions_notify: Arc<Notify>,
    ) -> Arc<Self> {
        let retrain_needed = organizer.requires_retraining();
        if retrain_needed {
            tracing::info!("retraining marker present: holding new self-play servers");
        }
        let (retrain_tx, _) = watch::channel(retrain_needed);
        Arc::new(Self {
            organizer,
            dbs,
            gpus,
            registry,
            shutdown,
            samples_per_window,
            max_positions_per_generation,
            restart_interval,
            gen0: Mutex::new(Gen0State::default()),
            gen0_notify: Notify::new(),
            retrain_tx,
            latest_gen,
            budget: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            positions_notify,
        })
    }

    /// Attach a freshly handshaken self-play server.
    pub fn add_server(self: &Arc<Self>, conn: Arc<ClientConnection>, reader: OwnedReadHalf) {
        spawn_recv_loop(
            conn,
            reader,
            Arc::new(ServerHandler(self.clone())),
            self.registry.clone(),
            self.shutdown.clone(),
        );
    }

    /// Attach a freshly handshaken self-play worker.
    pub fn add_worker(self: &Arc<Self>, conn: Arc<ClientConnection>, reader: OwnedReadHalf) {
        spawn_recv_loop(
            conn,
            reader,
            Arc::new(WorkerHandler(self.clone())),
            self.registry.clone(),
            self.shutdown.clone(),
        );
    }

    /// External retraining finished; release servers held in the preamble.
    pub fn signal_retraining_complete(&self) -> Result<(), ControlError> {
        self.organizer.clear_retraining_marker()?;
        self.retrain_tx.send_replace(false);
        Ok(())
    }

    /// Block until gen-0 self-play is complete. Re-evaluates the database
    /// first so restarts of a finished run skip the bootstrap entirely.
    pub async fn wait_for_gen0_completion(&self) -> Result<(), ControlError> {
        self.recompute_gen0_completion()?;
        loop {
            let notified = self.gen0_notify.notified();
            if self.gen0.lock().complete {
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = notified => {}
            }
        }
    }

    /// Send a soft quit to every connected self-play server.
    pub async fn quit_all(&self) {
        for conn in self.registry.by_role(crate::ipc::ClientRole::SelfPlayServer) {
            if conn.send(&Message::Quit).await.is_err() {
                tracing::debug!(%conn, "server already gone during quit broadcast");
            }
        }
    }

    /// One status line for the signal-triggered dump.
    pub fn status_dump(&self) {
        let gen0 = self.gen0.lock();
        tracing::info!(
            gen0_owner = ?gen0.owner,
            gen0_complete = gen0.complete,
            pending_games = self.pending.lock().len(),
            "self-play state"
        );
    }

    // ---- gen-0 bootstrap ----

    fn recompute_gen0_completion(&self) -> Result<(), ControlError> {
        let needed = self.num_additional_gen0_positions_needed()?;
        let mut state = self.gen0.lock();
        if !state.complete && needed == 0 {
            state.complete = true;
            drop(state);
            self.gen0_notify.notify_waiters();
        }
        Ok(())
    }

    /// Gen-0 shortfall, recomputed from the database.
    fn num_additional_gen0_positions_needed(&self) -> Result<u64, ControlError> {
        let row: Option<(Generation, i64)> = self.dbs.self_play.with_conn(|conn| {
            conn.query_row(
                "SELECT gen, augmented_positions FROM self_play_metadata \
                 ORDER BY gen DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        Ok(match row {
            None => self.samples_per_window,
            Some((gen, _)) if gen > 0 => 0,
            Some((_, positions)) => self
                .samples_per_window
                .saturating_sub(positions.max(0) as u64),
        })
    }

    /// Claim gen-0 ownership for `conn` if the bootstrap still needs rows.
    ///
    /// Blocks while another server owns gen-0. Returns true when this server
    /// was sent `start-gen0`; false when gen-0 is already complete.
    async fn launch_gen0_if_necessary(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> Result<bool, ControlError> {
        let max_rows = loop {
            let notified = self.gen0_notify.notified();
            enum Decision {
                Complete,
                Claimed(u64),
                Wait,
            }
            let decision = {
                let mut state = self.gen0.lock();
                if state.complete {
                    Decision::Complete
                } else if state.owner.is_none() {
                    let needed = self.num_additional_gen0_positions_needed()?;
                    if needed == 0 {
                        state.complete = true;
                        Decision::Complete
                    } else {
                        state.owner = Some(conn.client_id);
                        Decision::Claimed(needed)
                    }
                } else {
                    Decision::Wait
                }
            };
            match decision {
                Decision::Complete => {
                    self.gen0_notify.notify_waiters();
                    return Ok(false);
                }
                Decision::Claimed(needed) => break needed,
                Decision::Wait => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(true),
                        _ = conn.closed() => return Ok(true),
                        _ = notified => {}
                    }
                }
            }
        };

        tracing::info!(%conn, max_rows, "requesting gen-0 self-play");
        conn.send(&Message::StartGen0 { max_rows }).await?;
        Ok(true)
    }

    async fn handle_ready(&self, conn: &Arc<ClientConnection>) -> Result<(), ControlError> {
        if self.launch_gen0_if_necessary(conn).await? {
            return Ok(());
        }
        self.launch_self_play(conn).await
    }

    async fn handle_gen0_complete(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> Result<(), ControlError> {
        {
            let mut state = self.gen0.lock();
            if state.owner != Some(conn.client_id) {
                return Err(ControlError::Invariant(format!(
                    "{conn} reported gen0-complete without owning the bootstrap"
                )));
            }
            let needed = self.num_additional_gen0_positions_needed()?;
            if needed != 0 {
                return Err(ControlError::Invariant(format!(
                    "{conn} reported gen0-complete with {needed} rows outstanding"
                )));
            }
            state.owner = None;
            state.complete = true;
            tracing::info!("gen-0 self-play complete");
        }
        self.gen0_notify.notify_waiters();
        self.launch_self_play(conn).await
    }

    fn handle_server_disconnect(&self, conn: &Arc<ClientConnection>) {
        let mut state = self.gen0.lock();
        if state.owner == Some(conn.client_id) {
            // Treat the disconnect as if the owner never held the bootstrap;
            // completion is recomputed from what actually landed in the
            // database.
            state.owner = None;
            if !state.complete {
                match self.num_additional_gen0_positions_needed() {
                    Ok(0) => state.complete = true,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "gen-0 recompute failed on disconnect");
                        self.shutdown.request_shutdown(1);
                    }
                }
            }
        }
        drop(state);
        self.gen0_notify.notify_waiters();
    }

    // ---- steady-state self-play ----

    async fn launch_self_play(&self, conn: &Arc<ClientConnection>) -> Result<(), ControlError> {
        // The first model must exist before any non-gen-0 self-play runs.
        let mut latest = self.latest_gen.clone();
        if *latest.borrow() < 1 {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = conn.closed() => return Ok(()),
                changed = latest.wait_for(|g| *g >= 1) => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        let gen = *latest.borrow();
        let model = self.organizer.model_path(gen);
        if !model.is_file() {
            return Err(ControlError::Invariant(format!(
                "latest generation {gen} has no model artifact at {}",
                model.display()
            )));
        }

        tracing::info!(%conn, gen, "requesting self-play launch");
        conn.send(&Message::Start).await?;
        self.spawn_restart_timer(conn.clone());
        Ok(())
    }

    /// Long-running native processes leak; a periodic soft restart keeps
    /// them bounded.
    fn spawn_restart_timer(&self, conn: Arc<ClientConnection>) {
        let interval = self.restart_interval;
        let token = self.shutdown.token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = conn.closed() => break,
                    _ = tokio::time::sleep(interval) => {
                        tracing::info!(%conn, "requesting self-play restart");
                        if conn.send(&Message::Restart).await.is_err() {
                            tracing::warn!(%conn, "restart send failed; worker likely disconnected");
                            break;
                        }
                    }
                }
            }
        });
    }

    // ---- worker state machine ----

    fn spawn_worker_manager(self: &Arc<Self>, conn: Arc<ClientConnection>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.manage_worker(&conn).await {
                if e.is_connection_local() {
                    tracing::warn!(%conn, error = %e, "worker likely disconnected");
                } else {
                    tracing::error!(%conn, error = %e, "unexpected error managing worker");
                    manager.shutdown.request_shutdown(1);
                }
            }
        });
    }

    async fn manage_worker(&self, conn: &Arc<ClientConnection>) -> Result<(), ControlError> {
        let domain = conn.domain;
        let table = self.gpus.table(&conn.gpu_id);
        table.activate(domain);

        if !self.pause_worker(conn).await? {
            return Ok(());
        }

        while table.active(domain) {
            if !table.acquire_lock(domain).await {
                break;
            }
            self.refresh_weights_if_needed(conn).await?;
            if !self.unpause_worker(conn).await? {
                break;
            }
            if table.wait_for_lock_expiry(domain).await {
                if !self.pause_worker(conn).await? {
                    break;
                }
                if let Err(e) = table.release_lock(domain) {
                    // A disconnect may have deactivated the domain (and with
                    // it the lock) between the handshake and this release.
                    if table.active(domain) {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Pause handshake. Ok(false) means the worker disconnected.
    async fn pause_worker(&self, conn: &Arc<ClientConnection>) -> Result<bool, ControlError> {
        tracing::debug!(%conn, "pausing worker");
        conn.set_pending_pause();
        if let Err(e) = conn.send(&Message::Pause).await {
            tracing::warn!(%conn, error = %e, "pause send failed");
            return Ok(false);
        }
        Ok(conn.wait_pause_ack().await)
    }

    async fn unpause_worker(&self, conn: &Arc<ClientConnection>) -> Result<bool, ControlError> {
        tracing::debug!(%conn, "unpausing worker");
        conn.set_pending_unpause();
        if let Err(e) = conn.send(&Message::Unpause).await {
            tracing::warn!(%conn, error = %e, "unpause send failed");
            return Ok(false);
        }
        Ok(conn.wait_unpause_ack().await)
    }

    /// Ship the latest weights to the worker if it is behind.
    async fn refresh_weights_if_needed(
        &self,
        conn: &Arc<ClientConnection>,
    ) -> Result<(), ControlError> {
        let gen = *self.latest_gen.borrow();
        if gen == 0 || conn.sent_gen() == Some(gen) {
            return Ok(());
        }
        self.send_weights(conn, gen).await
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
        tracing::debug!(%conn, gen, bytes = bytes.len(), "weights sent");
        Ok(())
    }

    fn handle_worker_disconnect(&self, conn: &Arc<ClientConnection>) {
        // Pending acks were cleared when the connection was marked closed;
        // dropping the domain releases any lock the worker's manager held.
        let table = self.gpus.table(&conn.gpu_id);
        table.deactivate(conn.domain);
    }

    fn handle_log_msg(&self, conn: &Arc<ClientConnection>, line: &str, src: Option<&str>) {
        tracing::info!(
            client = conn.client_id,
            src = src.unwrap_or("-"),
            "{line}"
        );
    }
}

/// Receive-loop handler for self-play servers.
struct ServerHandler(Arc<SelfPlayManager>);

#[async_trait]
impl RecvHandler for ServerHandler {
    /// New servers are held until any externally signalled retraining is
    /// complete.
    async fn preamble(&self, conn: &Arc<ClientConnection>) {
        let mut rx = self.0.retrain_tx.subscribe();
        if *rx.borrow() {
            tracing::info!(%conn, "holding server until retraining completes");
            tokio::select! {
                _ = self.0.shutdown.cancelled() => {}
                _ = conn.closed() => {}
                _ = rx.wait_for(|needed| !needed) => {}
            }
        }
    }

    async fn handle(
        &self,
        conn: &Arc<ClientConnection>,
        msg: Message,
        _reader: &mut OwnedReadHalf,
    ) -> Result<LoopFlow, ControlError> {
        match msg {
            Message::Log { line, src } => self.0.handle_log_msg(conn, &line, src.as_deref()),
            Message::Ready => self.0.handle_ready(conn).await?,
            Message::Gen0Complete => self.0.handle_gen0_complete(conn).await?,
            Message::WorkerExit { src, .. } => {
                tracing::info!(%conn, src, "worker process exited");
            }
            other => {
                tracing::warn!(%conn, kind = other.kind(), "unexpected self-play-server message");
            }
        }
        Ok(LoopFlow::Continue)
    }

    async fn on_disconnect(&self, conn: &Arc<ClientConnection>) {
        self.0.handle_server_disconnect(conn);
    }
}

/// Receive-loop handler for self-play workers.
struct WorkerHandler(Arc<SelfPlayManager>);

#[async_trait]
impl RecvHandler for WorkerHandler {
    async fn handle(
        &self,
        conn: &Arc<ClientConnection>,
        msg: Message,
        reader: &mut OwnedReadHalf,
    ) -> Result<LoopFlow, ControlError> {
        match msg {
            Message::Log { line, src } => self.0.handle_log_msg(conn, &line, src.as_deref()),
            Message::PauseAck => conn
                .handle_pause_ack(now_ns())
                .map_err(ControlError::Invariant)?,
            Message::UnpauseAck => conn
                .handle_unpause_ack(now_ns())
                .map_err(ControlError::Invariant)?,
            Message::WeightsRequest { generation: None } => {
                // First weights request doubles as the worker's readiness
                // signal; it starts the pause/unpause state machine.
                self.0.spawn_worker_manager(conn.clone());
            }
            Message::WeightsRequest {
                generation: Some(gen),
            } => self.0.send_weights(conn, gen).await?,
            Message::Metrics {
                gen,
                timestamp,
                metrics,
            } => self.0.record_metrics(conn, gen, timestamp, &metrics)?,
            Message::Game {
                gen,
                start_timestamp,
                end_timestamp,
                rows,
                flush,
                done,
                metrics,
            } => {
                self.0
                    .handle_game(
                        conn,
                        reader,
                        ingest::GameHeader {
                            gen,
                            start_timestamp,
                            end_timestamp,
                            rows,
                            flush,
                            done,
                            metrics,
                        },
                    )
                    .await?;
            }
            Message::Done => return Ok(LoopFlow::Terminate),
            other => {
                tracing::warn!(%conn, kind = other.kind(), "unexpected self-play-worker message");
            }
        }
        Ok(LoopFlow::Continue)
    }

    async fn on_disconnect(&self, conn: &Arc<ClientConnection>) {
        self.0.handle_worker_disconnect(conn);
    }
}
