// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Training orchestration.
//!
//! A dedicated task waits for a generation's worth of fresh positions,
//! arbitrates for the training GPU, runs the external trainer, and commits
//! the new model atomically. Weight delivery to workers is lazy: committing
//! a generation bumps a watch channel, and each worker-manager refreshes the
//! worker on its next lock acquisition.

mod step;
mod window;

pub use step::{HeadStats, SubprocessTrainer, TrainError, TrainJob, TrainOutcome, TrainStep};
pub use window::{compose_window, window_size, GenSlice, TrainWindow, WindowParams};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Notify};

use crate::db::DatabaseManager;
use crate::gpu::{Domain, GpuContentionManager};
use crate::organizer::{DirectoryOrganizer, GenSeal};
use crate::shutdown::ShutdownManager;
use crate::{ControlError, Generation, TrainingParams};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Drives train steps and owns the latest-generation watch.
pub struct TrainingManager {
    organizer: Arc<DirectoryOrganizer>,
    dbs: Arc<DatabaseManager>,
    gpus: Arc<GpuContentionManager>,
    shutdown: Arc<ShutdownManager>,
    params: TrainingParams,
    trainer: Arc<dyn TrainStep>,
    cuda_device: String,
    latest_gen: watch::Sender<Generation>,
    /// Fired by the self-play manager after each committed flush.
    positions_notify: Arc<Notify>,
}

impl TrainingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organizer: Arc<DirectoryOrganizer>,
        dbs: Arc<DatabaseManager>,
        gpus: Arc<GpuContentionManager>,
        shutdown: Arc<ShutdownManager>,
        params: TrainingParams,
        trainer: Arc<dyn TrainStep>,
        cuda_device: String,
        positions_notify: Arc<Notify>,
    ) -> (Arc<Self>, watch::Receiver<Generation>) {
        let (latest_gen, rx) = watch::channel(organizer.latest_model_generation());
        (
            Arc::new(Self {
                organizer,
                dbs,
                gpus,
                shutdown,
                params,
                trainer,
                cuda_device,
                latest_gen,
                positions_notify,
            }),
            rx,
        )
    }

    pub fn latest_generation(&self) -> Generation {
        *self.latest_gen.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Generation> {
        self.latest_gen.subscribe()
    }

    /// Called once gen-0 is complete; trains the first model when the run
    /// has none yet. Deterministic even with an empty gen-0 (a zero
    /// samples-per-window run commits a trivial gen-1 model).
    pub async fn train_gen1_model_if_necessary(&self) -> Result<(), ControlError> {
        if self.latest_generation() == 0 {
            self.train_step().await?;
        }
        Ok(())
    }

    /// Main loop body: block until enough data, then step. Returns when
    /// shutdown is requested.
    pub async fn run(&self) -> Result<(), ControlError> {
        loop {
            if !self.wait_until_enough_training_data().await {
                return Ok(());
            }
            self.train_step().await?;
        }
    }

    /// Wait until the position history supports training the next
    /// generation. Returns false if shutdown interrupted the wait.
    pub async fn wait_until_enough_training_data(&self) -> bool {
        loop {
            let notified = self.positions_notify.notified();
            let latest = self.latest_generation();
            // The floor of one position keeps a zero-sample configuration
            // from retraining in a hot loop once gen-1 exists.
            let required = (self.params.samples_per_window * (u64::from(latest) + 1)).max(1);
            match self.total_positions_through(latest) {
                Ok(total) if total >= required => return true,
                Ok(total) => {
                    tracing::debug!(total, required, "waiting for training data");
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to read position totals");
                    self.shutdown.request_shutdown(1);
                    return false;
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = notified => {}
            }
        }
    }

    fn total_positions_through(&self, gen: Generation) -> Result<u64, crate::db::DbError> {
        self.dbs.self_play.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(augmented_positions), 0) FROM self_play_metadata \
                 WHERE gen <= ?1",
                (gen,),
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
        })
    }

    fn per_gen_aggregates(&self) -> Result<Vec<(Generation, u64)>, crate::db::DbError> {
        self.dbs.self_play.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT gen, augmented_positions FROM self_play_metadata ORDER BY gen",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?;
            rows.collect()
        })
    }

    /// Run one train step and commit the resulting generation.
    pub async fn train_step(&self) -> Result<(), ControlError> {
        let gen = self.latest_generation() + 1;
        // Training is active on the chosen table only for the duration of
        // the step; between steps self-play reclaims a shared GPU.
        let table = self.gpus.table_for_training();
        table.activate(Domain::Training);
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                table.deactivate(Domain::Training);
                return Ok(());
            }
            acquired = table.acquire_lock(Domain::Training) => {
                if !acquired {
                    return Ok(());
                }
            }
        }

        let result = self.train_step_locked(gen).await;

        table.release_lock(Domain::Training)?;
        table.deactivate(Domain::Training);
        result?;

        // Broadcast after the lock release: each live worker re-requests
        // weights lazily via the watch bump.
        self.latest_gen.send_replace(gen);
        crate::telemetry::record_training_step(gen);
        tracing::info!(gen, "training step committed");
        Ok(())
    }

    async fn train_step_locked(&self, gen: Generation) -> Result<(), ControlError> {
        let started = now_ns();
        let window = compose_window(&self.per_gen_aggregates()?, &self.params.window);
        tracing::info!(
            gen,
            n_window = window.n_window,
            n_total = window.n_total,
            "sampling from the most recent positions"
        );

        let model_path = self.organizer.model_path(gen);
        let checkpoint_path = self.organizer.checkpoint_path(gen);
        let resume = {
            let prev = self.organizer.checkpoint_path(gen - 1);
            prev.is_file().then_some(prev)
        };
        let job = TrainJob {
            gen,
            snapshot_steps: self.params.snapshot_steps,
            minibatch_size: self.params.minibatch_size,
            window: window.clone(),
            data_dir: self.organizer.self_play_data_dir(),
            resume_checkpoint: resume,
            model_out: DirectoryOrganizer::hidden_path(&model_path),
            checkpoint_out: DirectoryOrganizer::hidden_path(&checkpoint_path),
            cuda_device: self.cuda_device.clone(),
        };

        let outcome = self.trainer.execute(&job).await?;

        // Commit order: checkpoint first, then the model. A reader that
        // sees the model file can always resume from its checkpoint.
        self.organizer.commit_hidden(&checkpoint_path)?;
        self.organizer.commit_hidden(&model_path)?;
        self.organizer.write_player_entry(
            gen,
            self.organizer.latest_binary().as_deref(),
            &model_path,
        )?;
        tracing::info!(gen, model = %model_path.display(), "model saved");

        self.record_outcome(gen, started, now_ns(), &window, &outcome)?;
        if gen >= 1 {
            self.seal_previous_generation(gen - 1)?;
        }
        Ok(())
    }

    fn record_outcome(
        &self,
        gen: Generation,
        started: i64,
        finished: i64,
        window: &TrainWindow,
        outcome: &TrainOutcome,
    ) -> Result<(), crate::db::DbError> {
        self.dbs.training.with_txn(|txn| {
            txn.execute(
                "INSERT OR REPLACE INTO training \
                 (gen, start_timestamp, end_timestamp, minibatches, window_size, total_loss) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    gen,
                    started,
                    finished,
                    outcome.minibatches,
                    window.n_window as i64,
                    outcome.total_loss,
                ),
            )?;
            for head in &outcome.heads {
                txn.execute(
                    "INSERT OR REPLACE INTO training_heads \
                     (gen, head, accuracy_num, loss_num, den) VALUES (?1, ?2, ?3, ?4, ?5)",
                    (
                        gen,
                        head.head.as_str(),
                        head.accuracy_num,
                        head.loss_num,
                        head.den as i64,
                    ),
                )?;
            }
            Ok(())
        })
    }

    /// Seal the superseded gen's shared directory with its aggregates.
    fn seal_previous_generation(&self, gen: Generation) -> Result<(), ControlError> {
        if self.organizer.generation_sealed(gen) {
            return Ok(());
        }
        let stats = self.dbs.self_play.with_conn(|conn| {
            conn.query_row(
                "SELECT games, augmented_positions, runtime, positions_evaluated, \
                 batches_evaluated FROM self_play_metadata WHERE gen = ?1",
                (gen,),
                |row| {
                    Ok(GenSeal {
                        games: row.get::<_, i64>(0)?.max(0) as u64,
                        augmented_positions: row.get::<_, i64>(1)?.max(0) as u64,
                        runtime_ns: row.get(2)?,
                        positions_evaluated: row.get::<_, i64>(3)?.max(0) as u64,
                        batches_evaluated: row.get::<_, i64>(4)?.max(0) as u64,
                    })
                },
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(GenSeal::default()),
                other => Err(other),
            })
        })?;
        self.organizer.seal_generation(gen, &stats)?;
        Ok(())
    }
}
