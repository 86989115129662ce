// src/queue.rs

use crate::models::DownloadRequest;
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Durable, de-duplicated set of pending download requests, keyed by content
/// identifier and backed by an SQLite database.
///
/// This set is the single source of truth for "what is pending". All
/// mutations are whole-set operations; after each one the full snapshot is
/// republished on a watch channel so callers get a live view of the queue.
/// Snapshots are ordered by insertion (ascending rowid), which is also the
/// selection order used when promoting the next download.
#[derive(Clone)]
pub struct PersistedDownloadQueue {
    conn: Connection,
    snapshot_tx: Arc<watch::Sender<Vec<DownloadRequest>>>,
}

impl PersistedDownloadQueue {
    /// Opens (or creates) the backing database and loads the current set.
    pub async fn new(db_path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS pending_downloads (
                    identifier      TEXT PRIMARY KEY,
                    request_data    TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;

        let initial = Self::load_all(&conn).await?;
        let (snapshot_tx, _) = watch::channel(initial);
        Ok(Self {
            conn,
            snapshot_tx: Arc::new(snapshot_tx),
        })
    }

    async fn load_all(conn: &Connection) -> Result<Vec<DownloadRequest>, QueueError> {
        let requests = conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT request_data FROM pending_downloads ORDER BY rowid ASC")?;
                let request_iter = stmt.query_map([], |row| {
                    let request_data: String = row.get(0)?;
                    let request: DownloadRequest =
                        serde_json::from_str(&request_data).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?;
                    Ok(request)
                })?;

                let requests: Result<Vec<DownloadRequest>, rusqlite::Error> =
                    request_iter.collect();
                Ok(requests?)
            })
            .await?;
        Ok(requests)
    }

    async fn republish(&self) -> Result<(), QueueError> {
        let snapshot = Self::load_all(&self.conn).await?;
        self.snapshot_tx.send_replace(snapshot);
        Ok(())
    }

    /// Current contents in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<DownloadRequest>, QueueError> {
        Self::load_all(&self.conn).await
    }

    /// Live view of the queue, re-pushed after every mutation.
    pub fn watch(&self) -> watch::Receiver<Vec<DownloadRequest>> {
        self.snapshot_tx.subscribe()
    }

    /// Inserts each request keyed by identifier. Re-adding an identifier that
    /// is already present leaves the stored request untouched.
    pub async fn add_all(&self, requests: &[DownloadRequest]) -> Result<(), QueueError> {
        let mut rows = Vec::with_capacity(requests.len());
        for request in requests {
            rows.push((request.identifier.clone(), serde_json::to_string(request)?));
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (identifier, request_data) in rows {
                    tx.execute(
                        "INSERT OR IGNORE INTO pending_downloads (identifier, request_data)
                         VALUES (?1, ?2)",
                        params![identifier, request_data],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.republish().await
    }

    /// Replaces the stored request for its identifier (used to persist the
    /// backend-assigned id once a request is promoted). Keeps the original
    /// insertion position.
    pub async fn update(&self, request: &DownloadRequest) -> Result<(), QueueError> {
        let identifier = request.identifier.clone();
        let request_data = serde_json::to_string(request)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_downloads SET request_data = ?2 WHERE identifier = ?1",
                    params![identifier, request_data],
                )?;
                Ok(())
            })
            .await?;
        self.republish().await
    }

    /// Removes one request by identifier, returning it if it was present.
    pub async fn remove(
        &self,
        identifier: &str,
    ) -> Result<Option<DownloadRequest>, QueueError> {
        let key = identifier.to_string();
        let removed: Option<String> = self
            .conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT request_data FROM pending_downloads WHERE identifier = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                if existing.is_some() {
                    conn.execute(
                        "DELETE FROM pending_downloads WHERE identifier = ?1",
                        params![key],
                    )?;
                }
                Ok(existing)
            })
            .await?;
        self.republish().await?;
        match removed {
            Some(request_data) => Ok(Some(serde_json::from_str(&request_data)?)),
            None => Ok(None),
        }
    }

    /// Clears the whole set, returning the removed requests in insertion
    /// order.
    pub async fn clear(&self) -> Result<Vec<DownloadRequest>, QueueError> {
        let removed = Self::load_all(&self.conn).await?;
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM pending_downloads", [])?;
                Ok(())
            })
            .await?;
        self.republish().await?;
        Ok(removed)
    }
}
