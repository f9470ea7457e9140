// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Canonical filesystem layout of one run.
//!
//! ```text
//! BASE_DIR/
//!     clients.db  self_play.db  training.db  ratings.db
//!     fork.txt            # lineage record, present only on forked runs
//!     retrain.txt         # marker: hold self-play until retraining is done
//!     models/gen-{g}.model
//!     checkpoints/gen-{g}.ckpt
//!     players/gen-{g}.txt
//!     bins/{sha256}
//!     logs/loop-controller.log
//!     self-play-data/
//!         gen-{g}/done.txt            # written once the gen is sealed
//!         client-{id}/gen-{g}/{end_ts}.log
//! ```

mod fork;

pub use fork::ForkSummary;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{ClientId, Generation};

pub const MODEL_EXT: &str = "model";
pub const CHECKPOINT_EXT: &str = "ckpt";
pub const PLAYER_EXT: &str = "txt";

#[derive(Error, Debug)]
pub enum OrganizerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fork source {0} is not a run directory")]
    BadForkSource(PathBuf),

    #[error("ratings truncation failed: {0}")]
    RatingsTruncation(#[from] rusqlite::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> OrganizerError + '_ {
    move |source| OrganizerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Parse the generation out of a `gen-{g}.{ext}` or `gen-{g}` file name.
pub fn parse_generation(name: &str) -> Option<Generation> {
    let stem = name.split('.').next()?;
    let mut tokens = stem.split('-');
    loop {
        match tokens.next()? {
            "gen" => return tokens.next()?.parse().ok(),
            _ => continue,
        }
    }
}

/// Owns the filesystem layout of a single run.
#[derive(Debug, Clone)]
pub struct DirectoryOrganizer {
    base_dir: PathBuf,
}

impl DirectoryOrganizer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base_dir.join("models")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.base_dir.join("checkpoints")
    }

    pub fn players_dir(&self) -> PathBuf {
        self.base_dir.join("players")
    }

    pub fn bins_dir(&self) -> PathBuf {
        self.base_dir.join("bins")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn self_play_data_dir(&self) -> PathBuf {
        self.base_dir.join("self-play-data")
    }

    pub fn clients_db_path(&self) -> PathBuf {
        self.base_dir.join("clients.db")
    }

    pub fn self_play_db_path(&self) -> PathBuf {
        self.base_dir.join("self_play.db")
    }

    pub fn training_db_path(&self) -> PathBuf {
        self.base_dir.join("training.db")
    }

    pub fn ratings_db_path(&self) -> PathBuf {
        self.base_dir.join("ratings.db")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("loop-controller.log")
    }

    pub fn fork_txt_path(&self) -> PathBuf {
        self.base_dir.join("fork.txt")
    }

    pub fn retrain_txt_path(&self) -> PathBuf {
        self.base_dir.join("retrain.txt")
    }

    pub fn model_path(&self, gen: Generation) -> PathBuf {
        self.models_dir().join(format!("gen-{gen}.{MODEL_EXT}"))
    }

    pub fn checkpoint_path(&self, gen: Generation) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("gen-{gen}.{CHECKPOINT_EXT}"))
    }

    pub fn player_path(&self, gen: Generation) -> PathBuf {
        self.players_dir().join(format!("gen-{gen}.{PLAYER_EXT}"))
    }

    /// Shared per-gen self-play directory (holds the `done.txt` sentinel).
    pub fn gen_dir(&self, gen: Generation) -> PathBuf {
        self.self_play_data_dir().join(format!("gen-{gen}"))
    }

    /// Per-client game file destination.
    pub fn game_file_path(&self, client_id: ClientId, gen: Generation, end_ts: i64) -> PathBuf {
        self.self_play_data_dir()
            .join(format!("client-{client_id}"))
            .join(format!("gen-{gen}"))
            .join(format!("{end_ts}.log"))
    }

    pub fn makedirs(&self) -> Result<(), OrganizerError> {
        for dir in [
            self.models_dir(),
            self.checkpoints_dir(),
            self.players_dir(),
            self.bins_dir(),
            self.logs_dir(),
            self.self_play_data_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(())
    }

    fn latest_generation_in(&self, dir: &Path) -> Generation {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    return None;
                }
                parse_generation(&name)
            })
            .max()
            .unwrap_or(0)
    }

    /// Latest generation with a committed model artifact.
    pub fn latest_model_generation(&self) -> Generation {
        self.latest_generation_in(&self.models_dir())
    }

    pub fn latest_player_generation(&self) -> Generation {
        self.latest_generation_in(&self.players_dir())
    }

    pub fn latest_self_play_generation(&self) -> Generation {
        self.latest_generation_in(&self.self_play_data_dir())
    }

    /// Latest committed generation of the run.
    pub fn latest_generation(&self) -> Generation {
        self.latest_model_generation()
            .max(self.latest_player_generation())
    }

    /// Hidden sibling used for write-then-rename commits.
    pub fn hidden_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}"))
    }

    /// Atomically write `contents` to `path` via a hidden temp file.
    pub fn atomic_write(&self, path: &Path, contents: &[u8]) -> Result<(), OrganizerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let hidden = Self::hidden_path(path);
        fs::write(&hidden, contents).map_err(io_err(&hidden))?;
        fs::rename(&hidden, path).map_err(io_err(path))?;
        Ok(())
    }

    /// Promote a hidden artifact to its final name.
    pub fn commit_hidden(&self, final_path: &Path) -> Result<(), OrganizerError> {
        let hidden = Self::hidden_path(final_path);
        fs::rename(&hidden, final_path).map_err(io_err(final_path))?;
        Ok(())
    }

    /// Write the competitive-player entry for a committed generation.
    pub fn write_player_entry(
        &self,
        gen: Generation,
        binary: Option<&Path>,
        model: &Path,
    ) -> Result<(), OrganizerError> {
        let line = match binary {
            Some(bin) => format!("{} --player \"-m {}\"\n", bin.display(), model.display()),
            None => format!("--player \"-m {}\"\n", model.display()),
        };
        self.atomic_write(&self.player_path(gen), line.as_bytes())
    }

    /// Seal a generation's shared self-play directory with its aggregates.
    ///
    /// Idempotent: an existing `done.txt` is left untouched.
    pub fn seal_generation(&self, gen: Generation, stats: &GenSeal) -> Result<(), OrganizerError> {
        let dir = self.gen_dir(gen);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let done = dir.join("done.txt");
        if done.exists() {
            return Ok(());
        }
        let body = format!(
            "n_games={}\nn_positions={}\nruntime={}\nn_evaluated_positions={}\nn_batches_evaluated={}\n",
            stats.games,
            stats.augmented_positions,
            stats.runtime_ns,
            stats.positions_evaluated,
            stats.batches_evaluated,
        );
        self.atomic_write(&done, body.as_bytes())
    }

    pub fn generation_sealed(&self, gen: Generation) -> bool {
        self.gen_dir(gen).join("done.txt").is_file()
    }

    /// External retraining signal: hold new self-play servers until cleared.
    pub fn requires_retraining(&self) -> bool {
        self.retrain_txt_path().is_file()
    }

    pub fn clear_retraining_marker(&self) -> Result<(), OrganizerError> {
        let path = self.retrain_txt_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(OrganizerError::Io { path, source }),
        }
    }
}

/// Aggregate stats recorded in a sealed gen's `done.txt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenSeal {
    pub games: u64,
    pub augmented_positions: u64,
    pub runtime_ns: i64,
    pub positions_evaluated: u64,
    pub batches_evaluated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generation_from_artifact_names() {
        assert_eq!(parse_generation("gen-17.model"), Some(17));
        assert_eq!(parse_generation("gen-0"), Some(0));
        assert_eq!(parse_generation("gen-3.ckpt"), Some(3));
        assert_eq!(parse_generation("done.txt"), None);
        assert_eq!(parse_generation("client-4"), None);
    }

    #[test]
    fn latest_generation_is_max_of_models_and_players() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        org.makedirs().unwrap();
        assert_eq!(org.latest_generation(), 0);

        fs::write(org.model_path(2), b"m").unwrap();
        fs::write(org.model_path(3), b"m").unwrap();
        fs::write(org.player_path(1), b"p").unwrap();
        assert_eq!(org.latest_model_generation(), 3);
        assert_eq!(org.latest_player_generation(), 1);
        assert_eq!(org.latest_generation(), 3);
    }

    #[test]
    fn hidden_files_are_ignored_by_latest_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        org.makedirs().unwrap();
        fs::write(org.model_path(1), b"m").unwrap();
        fs::write(org.models_dir().join(".gen-9.model"), b"partial").unwrap();
        assert_eq!(org.latest_model_generation(), 1);
    }

    #[test]
    fn atomic_write_leaves_no_hidden_residue() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        let target = dir.path().join("models/gen-1.model");
        org.atomic_write(&target, b"weights").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"weights");
        assert!(!DirectoryOrganizer::hidden_path(&target).exists());
    }

    #[test]
    fn seal_generation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        org.makedirs().unwrap();

        let stats = GenSeal {
            games: 12,
            augmented_positions: 960,
            ..Default::default()
        };
        org.seal_generation(0, &stats).unwrap();
        assert!(org.generation_sealed(0));

        // Second seal must not clobber the sentinel.
        org.seal_generation(0, &GenSeal::default()).unwrap();
        let body = fs::read_to_string(org.gen_dir(0).join("done.txt")).unwrap();
        assert!(body.contains("n_positions=960"));
    }

    #[test]
    fn retraining_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        assert!(!org.requires_retraining());

        fs::write(org.retrain_txt_path(), b"").unwrap();
        assert!(org.requires_retraining());

        org.clear_retraining_marker().unwrap();
        assert!(!org.requires_retraining());
        org.clear_retraining_marker().unwrap();
    }
}
