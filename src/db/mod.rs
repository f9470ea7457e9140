// Copyright 2025-2026 Arcade Loop Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence layer: four logical SQLite databases.
//!
//! The embedded engine serializes writers, so every write transaction on the
//! same database goes through one in-process lock around a single pooled
//! connection. Contention therefore surfaces as immediate lock waits rather
//! than retryable BUSY errors.

pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::organizer::DirectoryOrganizer;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sql error on {db}: {source}")]
    Sql {
        db: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database {0} is closed")]
    Closed(&'static str),
}

/// One logical database: a single connection behind a coarse write lock.
pub struct Database {
    name: &'static str,
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    pub fn open(name: &'static str, path: &Path, schema: &[&str]) -> Result<Self, DbError> {
        let conn = Connection::open(path).map_err(|source| DbError::Sql { db: name, source })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|source| DbError::Sql { db: name, source })?;
        for stmt in schema {
            conn.execute(stmt, [])
                .map_err(|source| DbError::Sql { db: name, source })?;
        }
        Ok(Self {
            name,
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read (or single-statement write) against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(DbError::Closed(self.name))?;
        f(conn).map_err(|source| DbError::Sql {
            db: self.name,
            source,
        })
    }

    /// Run a write transaction under the database write lock.
    ///
    /// The closure runs between BEGIN IMMEDIATE and COMMIT; any error rolls
    /// the transaction back and propagates as fatal to the operation.
    pub fn with_txn<T>(
        &self,
        f: impl FnOnce(&Transaction) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(DbError::Closed(self.name))?;
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| DbError::Sql {
                db: self.name,
                source,
            })?;
        let value = f(&txn).map_err(|source| DbError::Sql {
            db: self.name,
            source,
        })?;
        txn.commit().map_err(|source| DbError::Sql {
            db: self.name,
            source,
        })?;
        Ok(value)
    }

    /// Close the connection; later calls fail with [`DbError::Closed`].
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(db = self.name, error = %e, "error closing database");
            }
        }
    }
}

/// The four logical databases of a run.
pub struct DatabaseManager {
    pub clients: Arc<Database>,
    pub self_play: Arc<Database>,
    pub training: Arc<Database>,
    pub ratings: Arc<Database>,
}

impl DatabaseManager {
    pub fn open(organizer: &DirectoryOrganizer) -> Result<Self, DbError> {
        Ok(Self {
            clients: Arc::new(Database::open(
                "clients",
                &organizer.clients_db_path(),
                schema::CLIENTS,
            )?),
            self_play: Arc::new(Database::open(
                "self_play",
                &organizer.self_play_db_path(),
                schema::SELF_PLAY,
            )?),
            training: Arc::new(Database::open(
                "training",
                &organizer.training_db_path(),
                schema::TRAINING,
            )?),
            ratings: Arc::new(Database::open(
                "ratings",
                &organizer.ratings_db_path(),
                schema::RATINGS,
            )?),
        })
    }

    /// Close all pools in reverse dependency order.
    pub fn close_all(&self) {
        self.ratings.close();
        self.training.close();
        self.self_play.close();
        self.clients.close();
    }
}
