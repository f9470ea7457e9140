// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Run forking and content-addressed binary staging.
//!
//! A fork creates a new run as symlinks over an existing run's artifacts up
//! to and including a chosen generation. Deleting the parent directory
//! breaks the fork. `fork.txt` records the lineage and short-circuits
//! repeated fork attempts on restart.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use super::{io_err, parse_generation, DirectoryOrganizer, OrganizerError};
use crate::Generation;

/// Result of a fork operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkSummary {
    /// Fork performed, linked up to and including this generation.
    Forked(Generation),
    /// `fork.txt` already present; recorded generation returned.
    AlreadyForked(Option<Generation>),
}

impl DirectoryOrganizer {
    /// Fork this (empty) run from `parent`, linking artifacts up to and
    /// including `gen`.
    ///
    /// Models, checkpoints, players and per-gen self-play directories become
    /// symlinks; binaries no newer than the newest linked artifact are
    /// copied; the ratings database is copied and truncated past `gen`.
    pub fn fork_from(
        &self,
        parent: &DirectoryOrganizer,
        gen: Generation,
    ) -> Result<ForkSummary, OrganizerError> {
        let fork_txt = self.fork_txt_path();
        if fork_txt.is_file() {
            let recorded = read_fork_generation(&fork_txt)?;
            tracing::info!(
                from = %parent.base_dir().display(),
                gen = ?recorded,
                "skipping fork: fork.txt already exists"
            );
            return Ok(ForkSummary::AlreadyForked(recorded));
        }
        if !parent.base_dir().is_dir() {
            return Err(OrganizerError::BadForkSource(
                parent.base_dir().to_path_buf(),
            ));
        }

        self.makedirs()?;

        let mut last_artifact_mtime = SystemTime::UNIX_EPOCH;
        for (src_dir, dst_dir) in [
            (parent.models_dir(), self.models_dir()),
            (parent.checkpoints_dir(), self.checkpoints_dir()),
            (parent.players_dir(), self.players_dir()),
            (parent.self_play_data_dir(), self.self_play_data_dir()),
        ] {
            link_up_to(&src_dir, &dst_dir, gen, &mut last_artifact_mtime)?;
        }

        // Only copy binaries at least as old as the newest linked artifact,
        // so the fork continues with the binary that produced gen.
        copy_bins(&parent.bins_dir(), &self.bins_dir(), last_artifact_mtime)?;

        let parent_ratings = parent.ratings_db_path();
        if parent_ratings.is_file() {
            let own_ratings = self.ratings_db_path();
            fs::copy(&parent_ratings, &own_ratings).map_err(io_err(&own_ratings))?;
            truncate_ratings(&own_ratings, gen)?;
        }

        let body = format!(
            "From: {}\nGen: {}\nForked-At: {}\n",
            parent.base_dir().display(),
            gen,
            chrono::Utc::now().to_rfc3339(),
        );
        self.atomic_write(&fork_txt, body.as_bytes())?;
        tracing::info!(from = %parent.base_dir().display(), gen, "forked run");
        Ok(ForkSummary::Forked(gen))
    }

    /// Stage a worker binary into `bins/`, named by its SHA-256 digest.
    /// Returns the staged path.
    pub fn stage_binary(&self, src: &Path) -> Result<PathBuf, OrganizerError> {
        let bytes = fs::read(src).map_err(io_err(src))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let target = self.bins_dir().join(digest);
        if !target.exists() {
            fs::create_dir_all(self.bins_dir()).map_err(io_err(&self.bins_dir()))?;
            fs::write(&target, &bytes).map_err(io_err(&target))?;
        }
        Ok(target)
    }

    /// Most recently staged binary, if any.
    pub fn latest_binary(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(self.bins_dir()).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((mtime, e.path()))
            })
            .max_by_key(|(mtime, _)| *mtime)
            .map(|(_, path)| path)
    }
}

fn read_fork_generation(fork_txt: &Path) -> Result<Option<Generation>, OrganizerError> {
    let body = fs::read_to_string(fork_txt).map_err(io_err(fork_txt))?;
    for line in body.lines() {
        if let Some(value) = line.strip_prefix("Gen:") {
            return Ok(value.trim().parse().ok());
        }
    }
    Ok(None)
}

fn link_up_to(
    src_dir: &Path,
    dst_dir: &Path,
    gen: Generation,
    last_mtime: &mut SystemTime,
) -> Result<(), OrganizerError> {
    let entries = match fs::read_dir(src_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') {
            continue;
        }
        match parse_generation(&name_str) {
            Some(g) if g <= gen => {}
            _ => continue,
        }
        let src = entry.path();
        let dst = dst_dir.join(&name);
        symlink(&src, &dst).map_err(io_err(&dst))?;
        if let Ok(meta) = entry.metadata() {
            if let Ok(mtime) = meta.modified() {
                *last_mtime = (*last_mtime).max(mtime);
            }
        }
    }
    Ok(())
}

fn copy_bins(src_dir: &Path, dst_dir: &Path, cutoff: SystemTime) -> Result<(), OrganizerError> {
    let entries = match fs::read_dir(src_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let src = entry.path();
        if !src.is_file() {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if mtime > cutoff {
            continue;
        }
        let dst = dst_dir.join(entry.file_name());
        fs::copy(&src, &dst).map_err(io_err(&dst))?;
    }
    Ok(())
}

fn truncate_ratings(db_path: &Path, gen: Generation) -> Result<(), OrganizerError> {
    let conn = rusqlite::Connection::open(db_path)?;
    for table in ["matches", "ratings"] {
        // The copied database may predate one of the tables.
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            (table,),
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;
        if exists {
            conn.execute(&format!("DELETE FROM {table} WHERE mcts_gen > ?1"), (gen,))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn parent_run() -> (tempfile::TempDir, DirectoryOrganizer) {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        org.makedirs().unwrap();
        for g in 1..=7u32 {
            fs::write(org.model_path(g), format!("model-{g}")).unwrap();
            fs::write(org.checkpoint_path(g), format!("ckpt-{g}")).unwrap();
            fs::write(org.player_path(g), format!("player-{g}")).unwrap();
            fs::create_dir_all(org.gen_dir(g)).unwrap();
        }
        (dir, org)
    }

    fn seed_ratings(org: &DirectoryOrganizer) {
        let conn = rusqlite::Connection::open(org.ratings_db_path()).unwrap();
        for stmt in schema::RATINGS {
            conn.execute(stmt, []).unwrap();
        }
        for g in 1..=7i64 {
            conn.execute(
                "INSERT INTO matches (mcts_gen, ref_strength, n_games, wins, draws, losses) \
                 VALUES (?1, 5, 10, 6, 2, 2)",
                (g,),
            )
            .unwrap();
            conn.execute(
                "INSERT INTO ratings (mcts_gen, n_games, rating) VALUES (?1, 10, 5.0)",
                (g,),
            )
            .unwrap();
        }
    }

    #[test]
    fn fork_links_artifacts_up_to_gen() {
        let (_parent_dir, parent) = parent_run();
        let child_dir = tempfile::tempdir().unwrap();
        let child = DirectoryOrganizer::new(child_dir.path());

        let summary = child.fork_from(&parent, 5).unwrap();
        assert_eq!(summary, ForkSummary::Forked(5));

        for g in 1..=5u32 {
            assert!(child.model_path(g).exists(), "model gen-{g} missing");
            assert!(child
                .model_path(g)
                .symlink_metadata()
                .unwrap()
                .file_type()
                .is_symlink());
            assert!(child.checkpoint_path(g).exists());
            assert!(child.player_path(g).exists());
            assert!(child.gen_dir(g).exists());
        }
        for g in 6..=7u32 {
            assert!(!child.model_path(g).exists(), "model gen-{g} leaked");
        }
        assert!(child.fork_txt_path().is_file());
        assert_eq!(child.latest_generation(), 5);
    }

    #[test]
    fn fork_truncates_ratings_past_gen() {
        let (_parent_dir, parent) = parent_run();
        seed_ratings(&parent);
        let child_dir = tempfile::tempdir().unwrap();
        let child = DirectoryOrganizer::new(child_dir.path());

        child.fork_from(&parent, 5).unwrap();

        let conn = rusqlite::Connection::open(child.ratings_db_path()).unwrap();
        let max_match: i64 = conn
            .query_row("SELECT MAX(mcts_gen) FROM matches", [], |r| r.get(0))
            .unwrap();
        let max_rating: i64 = conn
            .query_row("SELECT MAX(mcts_gen) FROM ratings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(max_match, 5);
        assert_eq!(max_rating, 5);
    }

    #[test]
    fn fork_is_idempotent() {
        let (_parent_dir, parent) = parent_run();
        let child_dir = tempfile::tempdir().unwrap();
        let child = DirectoryOrganizer::new(child_dir.path());

        child.fork_from(&parent, 3).unwrap();
        let again = child.fork_from(&parent, 6).unwrap();
        assert_eq!(again, ForkSummary::AlreadyForked(Some(3)));
        assert!(!child.model_path(6).exists());
    }

    #[test]
    fn stage_binary_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let org = DirectoryOrganizer::new(dir.path());
        org.makedirs().unwrap();

        let src = dir.path().join("worker-bin");
        fs::write(&src, b"\x7fELF...").unwrap();

        let first = org.stage_binary(&src).unwrap();
        let second = org.stage_binary(&src).unwrap();
        assert_eq!(first, second);
        assert_eq!(org.latest_binary(), Some(first.clone()));
        assert_eq!(
            first.file_name().unwrap().to_string_lossy().len(),
            64,
            "bins are named by sha256 hex digest"
        );
    }
}
