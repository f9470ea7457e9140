// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! The loop controller: wiring, accept dispatch, main loop, teardown.
//!
//! Owns every subsystem and all lifetimes; subsystems receive `Arc`s to the
//! shared pieces they need rather than a back-reference to the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::db::DatabaseManager;
use crate::gpu::{GpuContentionManager, GpuId};
use crate::ipc::{Acceptor, ClientRole, ConnectionRegistry};
use crate::organizer::DirectoryOrganizer;
use crate::ratings::RatingsManager;
use crate::selfplay::SelfPlayManager;
use crate::shutdown::ShutdownManager;
use crate::training::{TrainStep, TrainingManager};
use crate::{ControlError, ControllerParams, TrainingParams};

/// Window granted to workers between a soft `quit` and a hard close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// The long-running coordinator of one training run.
pub struct LoopController {
    params: ControllerParams,
    organizer: Arc<DirectoryOrganizer>,
    dbs: Arc<DatabaseManager>,
    gpus: Arc<GpuContentionManager>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownManager>,
    acceptor: Arc<Acceptor>,
    selfplay: Arc<SelfPlayManager>,
    training: Arc<TrainingManager>,
    ratings: Arc<RatingsManager>,
}

impl LoopController {
    pub fn new(
        params: ControllerParams,
        training_params: TrainingParams,
        trainer: Arc<dyn TrainStep>,
    ) -> Result<Arc<Self>, ControlError> {
        let organizer = Arc::new(DirectoryOrganizer::new(params.output_dir.clone()));
        organizer.makedirs()?;
        crate::telemetry::init_metrics();

        let dbs = Arc::new(DatabaseManager::open(&organizer)?);
        let gpus = Arc::new(GpuContentionManager::new(
            GpuId::new("127.0.0.1", params.cuda_device.clone()),
            params.leases,
        ));
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownManager::new();
        let acceptor = Arc::new(Acceptor::new(
            registry.clone(),
            dbs.clients.clone(),
            params.game.clone(),
        ));

        let positions_notify = Arc::new(Notify::new());
        let (training, latest_gen) = TrainingManager::new(
            organizer.clone(),
            dbs.clone(),
            gpus.clone(),
            shutdown.clone(),
            training_params.clone(),
            trainer,
            params.cuda_device.clone(),
            positions_notify.clone(),
        );
        let selfplay = SelfPlayManager::new(
            organizer.clone(),
            dbs.clone(),
            gpus.clone(),
            registry.clone(),
            shutdown.clone(),
            training_params.samples_per_window,
            params.max_positions_per_generation,
            params.restart_interval,
            latest_gen.clone(),
            positions_notify,
        );
        let ratings = RatingsManager::new(
            organizer.clone(),
            dbs.clone(),
            gpus.clone(),
            registry.clone(),
            shutdown.clone(),
            params.ratings.clone(),
            latest_gen,
        );

        Ok(Arc::new(Self {
            params,
            organizer,
            dbs,
            gpus,
            registry,
            shutdown,
            acceptor,
            selfplay,
            training,
            ratings,
        }))
    }

    pub fn organizer(&self) -> &Arc<DirectoryOrganizer> {
        &self.organizer
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn selfplay(&self) -> &Arc<SelfPlayManager> {
        &self.selfplay
    }

    /// Bind the configured port and serve until shutdown. Returns the exit
    /// code.
    pub async fn run(self: Arc<Self>) -> i32 {
        let addr = ("0.0.0.0", self.params.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(port = self.params.port, error = %e, "failed to bind");
                return 1;
            }
        };
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener (tests bind port 0 themselves).
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> i32 {
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            game = %self.params.game,
            tag = self.params.tag.as_deref().unwrap_or("-"),
            "listening for clients"
        );

        self.register_teardown();
        self.spawn_signal_handlers();
        self.ratings.spawn_background_tasks();
        self.spawn_accept_loop(listener);
        self.spawn_main_loop();

        // Outer loop: park until a child task signals an error or the
        // operator interrupts.
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::info!("error-signalled shutdown in progress");
            }
            interrupt = tokio::signal::ctrl_c() => {
                if let Err(e) = interrupt {
                    tracing::error!(error = %e, "signal handler failed");
                }
                tracing::info!("caught interrupt");
                self.shutdown.request_shutdown(0);
            }
        }

        self.shutdown.run_teardown().await;
        self.shutdown.exit_code()
    }

    fn register_teardown(&self) {
        // Registration order is the reverse of execution order: databases
        // close last, the soft quit broadcast runs first.
        let dbs = self.dbs.clone();
        self.shutdown.register("close-databases", async move {
            dbs.close_all();
        });

        let registry = self.registry.clone();
        self.shutdown.register("close-connections", async move {
            registry.close_all();
        });

        let ratings = self.ratings.clone();
        let registry = self.registry.clone();
        self.shutdown.register("drain-ratings", async move {
            if !registry.by_role(ClientRole::RatingsServer).is_empty() {
                ratings.drain(DRAIN_TIMEOUT).await;
            }
        });

        let selfplay = self.selfplay.clone();
        let registry = self.registry.clone();
        self.shutdown.register("quit-self-play", async move {
            selfplay.quit_all().await;
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while tokio::time::Instant::now() < deadline {
                let servers = registry.by_role(ClientRole::SelfPlayServer);
                let workers = registry.by_role(ClientRole::SelfPlayWorker);
                if servers.is_empty() && workers.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    /// SIGUSR1 dumps a status snapshot of every subsystem to the log.
    fn spawn_signal_handlers(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            let controller = self.clone();
            let token = self.shutdown.token();
            tokio::spawn(async move {
                let mut stream = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::user_defined1(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to install SIGUSR1 handler");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        received = stream.recv() => {
                            if received.is_none() {
                                break;
                            }
                            controller.status_dump();
                        }
                    }
                }
            });
        }
    }

    fn status_dump(&self) {
        tracing::info!(connections = self.registry.len(), "status dump requested");
        for conn in self.registry.snapshot() {
            tracing::info!(connection = ?conn, "live connection");
        }
        self.gpus.status_dump();
        self.selfplay.status_dump();
        self.ratings.status_dump();
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let controller = self.clone();
        let token = self.shutdown.token();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                match controller.acceptor.accept(stream).await {
                    Ok(Some((conn, reader))) => {
                        match conn.role {
                            ClientRole::SelfPlayServer => {
                                controller.selfplay.add_server(conn, reader)
                            }
                            ClientRole::SelfPlayWorker => {
                                controller.selfplay.add_worker(conn, reader)
                            }
                            ClientRole::RatingsServer => {
                                controller.ratings.add_server(conn, reader)
                            }
                            ClientRole::RatingsWorker => {
                                controller.ratings.add_worker(conn, reader)
                            }
                        }
                        crate::telemetry::record_active_connections(controller.registry.len());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "accept path failed");
                        controller.shutdown.request_shutdown(1);
                        break;
                    }
                }
            }
        });
    }

    /// Gen-0 gate, gen-1 bootstrap, then the steady training loop.
    fn spawn_main_loop(self: &Arc<Self>) {
        let selfplay = self.selfplay.clone();
        let training = self.training.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result: Result<(), ControlError> = async {
                selfplay.wait_for_gen0_completion().await?;
                if shutdown.is_shutdown() {
                    return Ok(());
                }
                training.train_gen1_model_if_necessary().await?;
                training.run().await
            }
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "unexpected error in main loop");
                shutdown.request_shutdown(1);
            }
        });
    }
}
