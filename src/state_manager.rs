// src/state_manager.rs

use crate::models::Range;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sidecar belongs to {found}, not {expected}")]
    ForeignRecord { expected: String, found: String },
    #[error("sidecar holds a malformed range {0:?}")]
    MalformedRange(Range),
}

/// What the sidecar remembers about a download.
///
/// Only covered intervals are stored, never per-block flags, so the record
/// grows with the number of gaps rather than with the file size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub url: String,
    pub filename: String,
    pub total_size: Option<u64>,
    pub ranges: Vec<Range>,
}

impl SidecarRecord {
    /// Rejects records written for another URL or holding inverted ranges.
    pub fn validate(&self, url: &str) -> Result<(), StateError> {
        if self.url != url {
            return Err(StateError::ForeignRecord {
                expected: url.to_string(),
                found: self.url.clone(),
            });
        }
        match self.ranges.iter().find(|r| !r.is_well_formed()) {
            Some(bad) => Err(StateError::MalformedRange(*bad)),
            None => Ok(()),
        }
    }
}

/// Persists a single [`SidecarRecord`] in an SQLite file next to the download.
///
/// Every save is one `INSERT OR REPLACE`, i.e. one transaction, so a process
/// that dies mid-save leaves either the old record or the new one behind.
pub struct StateManager {
    conn: Connection,
    path: PathBuf,
}

impl StateManager {
    /// Opens (or creates) the sidecar at `path` and makes sure the table exists.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(path).await?;
        let manager = Self { conn, path: path.to_path_buf() };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS progress (
                        id              INTEGER PRIMARY KEY,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored record, if one was ever saved.
    pub async fn load(&self) -> Result<Option<SidecarRecord>, StateError> {
        let raw = self
            .conn
            .call(|conn| {
                let raw = conn
                    .query_row("SELECT record FROM progress WHERE id = 1", [], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?;
                Ok(raw)
            })
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Atomically replaces the stored record.
    pub async fn save(&self, record: &SidecarRecord) -> Result<(), StateError> {
        let data = serde_json::to_string(record)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO progress (id, record) VALUES (1, ?1)",
                    params![data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Closes the database and removes the sidecar file.
    pub async fn delete(self) -> Result<(), StateError> {
        self.conn.close().await?;
        remove_sidecar(&self.path).await?;
        Ok(())
    }
}

/// Removes a sidecar and any journal SQLite left next to it. Missing files
/// are not an error.
pub async fn remove_sidecar(path: &Path) -> Result<(), std::io::Error> {
    let mut journal = path.as_os_str().to_owned();
    journal.push("-journal");
    for target in [path.to_path_buf(), PathBuf::from(journal)] {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
