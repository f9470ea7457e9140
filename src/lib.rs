//! ARCADE-LOOP - Loop controller for a distributed AlphaZero-style training run.
//!
//! A long-running coordinator that drives an iterative loop of self-play game
//! generation by remote worker processes, neural-network training on the
//! generated data, and rating matches against reference opponents.
//!
//! External native binary workers connect over TCP, execute bounded work
//! units under controller direction, stream game records and telemetry back,
//! and are paused/resumed to share scarce GPUs.
//!
//! # Architecture
//!
//! - **Control plane**: length-prefixed JSON frames over TCP ([`ipc`])
//! - **GPU arbitration**: per-device priority/lock tables ([`gpu`])
//! - **Persistence**: four logical SQLite databases ([`db`])
//! - **Filesystem**: one run root, generation-indexed artifacts ([`organizer`])
//!
//! The controller performs no model inference itself; training is delegated
//! to an external trainer process behind the [`training::TrainStep`] seam.

pub mod config;
pub mod controller;
pub mod db;
pub mod gpu;
pub mod ipc;
pub mod organizer;
pub mod ratings;
pub mod selfplay;
pub mod shutdown;
pub mod telemetry;
pub mod training;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use controller::LoopController;

/// An epoch in the training loop. Gen 0 is bootstrapped by random play;
/// every later gen has a committed model artifact.
pub type Generation = u32;

/// Row id in the `clients` table; stable across reconnects of the same
/// manager identity.
pub type ClientId = i64;

/// Top-level controller configuration, assembled from the CLI and an
/// optional TOML overlay.
#[derive(Debug, Clone)]
pub struct ControllerParams {
    /// TCP port the controller listens on.
    pub port: u16,
    /// Run root directory.
    pub output_dir: PathBuf,
    /// Game name, echoed to clients in the handshake ack.
    pub game: String,
    /// Optional run tag, recorded in sentinel files.
    pub tag: Option<String>,
    /// Per-generation row budget. `None` disables the budget check.
    pub max_positions_per_generation: Option<u64>,
    /// Default training device, e.g. `cuda:0`.
    pub cuda_device: String,
    /// GPU lock lease durations.
    pub leases: gpu::LeaseConfig,
    /// Interval between soft restarts of self-play servers.
    pub restart_interval: Duration,
    /// Ratings match scheduling knobs.
    pub ratings: ratings::RatingsParams,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            port: 1234,
            output_dir: PathBuf::from("."),
            game: String::new(),
            tag: None,
            max_positions_per_generation: None,
            cuda_device: "cuda:0".to_string(),
            leases: gpu::LeaseConfig::default(),
            restart_interval: Duration::from_secs(3600),
            ratings: ratings::RatingsParams::default(),
        }
    }
}

/// Training schedule parameters.
#[derive(Debug, Clone)]
pub struct TrainingParams {
    /// Positions required per generation window; also the gen-0 quota.
    pub samples_per_window: u64,
    /// Minibatch size passed to the trainer.
    pub minibatch_size: u32,
    /// Minibatch updates per train step.
    pub snapshot_steps: u32,
    /// Sliding-window shape parameters.
    pub window: training::WindowParams,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            samples_per_window: 100_000,
            minibatch_size: 256,
            snapshot_steps: 2048,
            window: training::WindowParams::default(),
        }
    }
}

/// Error surfaced by message handlers and subsystem tasks.
///
/// Protocol and transient I/O errors stay local to the offending connection;
/// everything else escalates to the shutdown manager.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ipc::ProtocolError),

    #[error("persistence failure: {0}")]
    Db(#[from] db::DbError),

    #[error("filesystem failure: {0}")]
    Organizer(#[from] organizer::OrganizerError),

    #[error("train step failed: {0}")]
    Train(#[from] training::TrainError),

    #[error("gpu contention error: {0}")]
    Contention(#[from] gpu::ContentionError),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Whether the error is recoverable by closing the offending connection,
    /// as opposed to threatening shared state.
    pub fn is_connection_local(&self) -> bool {
        matches!(self, ControlError::Protocol(_) | ControlError::Io(_))
    }
}
