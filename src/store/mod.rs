//! Local mashup test history backed by an embedded DuckDB database.
//!
//! Architecture:
//! - `TestResultStore` is the public API, holding a `mpsc::Sender<StoreCommand>`
//! - `StoreWorker` runs on `std::thread::spawn` (DuckDB is sync) and owns the connection
//! - Every call sends one command and awaits a oneshot reply, so the worker
//!   serializes all transactions against the collection
//! - The worker is spawned lazily by `initialize()`, once per store

pub mod schema;

use std::path::PathBuf;
use std::thread::JoinHandle;

use duckdb::params;
use tokio::sync::{OnceCell, mpsc, oneshot};

pub use schema::TestRecord;

use crate::error::StatusError;

/// Commands buffered before callers start waiting on the worker.
const COMMAND_BUFFER: usize = 64;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Private in-memory database; gone when the store is dropped.
    InMemory,
}

type Reply<T> = oneshot::Sender<Result<T, StatusError>>;

enum StoreCommand {
    Put {
        record: TestRecord,
        results_json: String,
        reply: Reply<()>,
    },
    ForMashup {
        mashup_id: String,
        reply: Reply<Vec<TestRecord>>,
    },
    All {
        reply: Reply<Vec<TestRecord>>,
    },
    Delete {
        id: String,
        reply: Reply<()>,
    },
    DeleteForMashup {
        mashup_id: String,
        reply: Reply<usize>,
    },
    Clear {
        reply: Reply<()>,
    },
    Count {
        reply: Reply<usize>,
    },
    Shutdown,
}

struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        // Full queue: the worker exits on its own once the sender drops.
        if self.tx.try_send(StoreCommand::Shutdown).is_err() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Durable, indexed store of `TestRecord`s.
///
/// Nothing touches disk until `initialize()` succeeds; every other operation
/// fails with `StorageUnavailable` before that.
pub struct TestResultStore {
    location: StoreLocation,
    handle: OnceCell<StoreHandle>,
}

impl TestResultStore {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            handle: OnceCell::new(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreLocation::File(path.into()))
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::InMemory)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_ready(&self) -> bool {
        self.handle.initialized()
    }

    /// Open (creating if absent) the database, its collection and indices.
    ///
    /// Idempotent: once open, later calls return immediately. A failed attempt
    /// leaves the store closed, so a later call may retry.
    pub async fn initialize(&self) -> Result<(), StatusError> {
        self.handle
            .get_or_try_init(|| self.spawn_worker())
            .await
            .map(|_| ())
    }

    /// Upsert by test id, stamping the current time. Returns the stored record.
    pub async fn put_test(
        &self,
        mashup_id: &str,
        test_id: &str,
        results: serde_json::Value,
    ) -> Result<TestRecord, StatusError> {
        let results_json = serde_json::to_string(&results)
            .map_err(|e| StatusError::Storage(format!("unserializable results: {e}")))?;
        let record = TestRecord::stamped(mashup_id, test_id, results);
        let stored = record.clone();
        self.call(|reply| StoreCommand::Put {
            record,
            results_json,
            reply,
        })
        .await?;
        Ok(stored)
    }

    /// Records for one mashup, newest first. Empty when there are none.
    pub async fn get_tests_for_mashup(
        &self,
        mashup_id: &str,
    ) -> Result<Vec<TestRecord>, StatusError> {
        let mashup_id = mashup_id.to_string();
        self.call(|reply| StoreCommand::ForMashup { mashup_id, reply })
            .await
    }

    /// Every record in the store.
    pub async fn get_all_tests(&self) -> Result<Vec<TestRecord>, StatusError> {
        self.call(|reply| StoreCommand::All { reply }).await
    }

    /// Remove one record. Absent ids are not an error.
    pub async fn delete_test(&self, test_id: &str) -> Result<(), StatusError> {
        let id = test_id.to_string();
        self.call(|reply| StoreCommand::Delete { id, reply }).await
    }

    /// Remove every record of a mashup in one transaction. Returns how many went.
    pub async fn delete_all_for_mashup(&self, mashup_id: &str) -> Result<usize, StatusError> {
        let mashup_id = mashup_id.to_string();
        self.call(|reply| StoreCommand::DeleteForMashup { mashup_id, reply })
            .await
    }

    pub async fn clear_all(&self) -> Result<(), StatusError> {
        self.call(|reply| StoreCommand::Clear { reply }).await
    }

    pub async fn count(&self) -> Result<usize, StatusError> {
        self.call(|reply| StoreCommand::Count { reply }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, StatusError> {
        let handle = self
            .handle
            .get()
            .ok_or_else(|| StatusError::StorageUnavailable("store not initialized".into()))?;
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(command(reply))
            .await
            .map_err(|_| StatusError::Storage("store worker is gone".into()))?;
        rx.await
            .map_err(|_| StatusError::Storage("store worker dropped reply".into()))?
    }

    async fn spawn_worker(&self) -> Result<StoreHandle, StatusError> {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let location = self.location.clone();

        let builder = std::thread::Builder::new().name("status-test-store".into());
        let worker = builder
            .spawn(move || StoreWorker::run(rx, location, ready_tx))
            .map_err(|e| {
                StatusError::StorageUnavailable(format!("failed to spawn store worker: {e}"))
            })?;

        match ready_rx.await {
            Ok(Ok(version)) => {
                tracing::info!(location = ?self.location, version, "test store ready");
                Ok(StoreHandle {
                    tx,
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                tracing::warn!(location = ?self.location, "test store unavailable: {e}");
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(StatusError::StorageUnavailable(
                    "store worker exited before ready".into(),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

struct StoreWorker {
    conn: duckdb::Connection,
}

impl StoreWorker {
    fn run(
        mut rx: mpsc::Receiver<StoreCommand>,
        location: StoreLocation,
        ready: oneshot::Sender<Result<i32, StatusError>>,
    ) {
        let opened = open_connection(&location).and_then(|conn| {
            let version = schema::apply_migrations(&conn)
                .map_err(|e| StatusError::StorageUnavailable(e.to_string()))?;
            Ok((conn, version))
        });
        let mut worker = match opened {
            Ok((conn, version)) => {
                if ready.send(Ok(version)).is_err() {
                    return;
                }
                StoreWorker { conn }
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        while let Some(command) = rx.blocking_recv() {
            match command {
                StoreCommand::Put {
                    record,
                    results_json,
                    reply,
                } => {
                    let _ = reply.send(worker.put(&record, &results_json).map_err(storage));
                }
                StoreCommand::ForMashup { mashup_id, reply } => {
                    let _ = reply.send(worker.for_mashup(&mashup_id));
                }
                StoreCommand::All { reply } => {
                    let _ = reply.send(worker.all());
                }
                StoreCommand::Delete { id, reply } => {
                    let _ = reply.send(worker.delete(&id).map_err(storage));
                }
                StoreCommand::DeleteForMashup { mashup_id, reply } => {
                    let _ = reply.send(worker.delete_for_mashup(&mashup_id).map_err(storage));
                }
                StoreCommand::Clear { reply } => {
                    let _ = reply.send(worker.clear().map_err(storage));
                }
                StoreCommand::Count { reply } => {
                    let _ = reply.send(worker.count().map_err(storage));
                }
                StoreCommand::Shutdown => break,
            }
        }
        tracing::debug!("test store worker exiting");
    }

    /// Replace-by-id inside one transaction. `write_seq` keeps newest-first
    /// ordering deterministic when two writes share a millisecond.
    fn put(&mut self, record: &TestRecord, results_json: &str) -> duckdb::Result<()> {
        let tx = self.conn.transaction()?;
        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(write_seq), 0) + 1 FROM mashup_tests",
            [],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM mashup_tests WHERE id = ?", params![record.id])?;
        tx.execute(
            "INSERT INTO mashup_tests (id, mashup_id, created_at, results, write_seq) \
             VALUES (?, ?, ?, ?, ?)",
            params![record.id, record.mashup_id, record.timestamp, results_json, next_seq],
        )?;
        tx.commit()
    }

    fn for_mashup(&self, mashup_id: &str) -> Result<Vec<TestRecord>, StatusError> {
        self.select(
            "SELECT id, mashup_id, created_at, results FROM mashup_tests \
             WHERE mashup_id = ? ORDER BY created_at DESC, write_seq DESC",
            &[mashup_id],
        )
    }

    fn all(&self) -> Result<Vec<TestRecord>, StatusError> {
        self.select(
            "SELECT id, mashup_id, created_at, results FROM mashup_tests \
             ORDER BY created_at DESC, write_seq DESC",
            &[],
        )
    }

    fn select(&self, sql: &str, args: &[&str]) -> Result<Vec<TestRecord>, StatusError> {
        let mut stmt = self.conn.prepare(sql).map_err(storage)?;
        let rows = stmt
            .query_map(duckdb::params_from_iter(args), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;

        rows.into_iter()
            .map(|(id, mashup_id, timestamp, results)| {
                let results = serde_json::from_str(&results).map_err(|e| {
                    StatusError::Storage(format!("corrupt results for test {id}: {e}"))
                })?;
                Ok(TestRecord {
                    id,
                    mashup_id,
                    timestamp,
                    results,
                })
            })
            .collect()
    }

    fn delete(&self, id: &str) -> duckdb::Result<()> {
        self.conn
            .execute("DELETE FROM mashup_tests WHERE id = ?", params![id])?;
        Ok(())
    }

    fn delete_for_mashup(&mut self, mashup_id: &str) -> duckdb::Result<usize> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM mashup_tests WHERE mashup_id = ?",
            params![mashup_id],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn clear(&self) -> duckdb::Result<()> {
        self.conn.execute_batch("DELETE FROM mashup_tests")
    }

    fn count(&self) -> duckdb::Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mashup_tests", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn open_connection(location: &StoreLocation) -> Result<duckdb::Connection, StatusError> {
    let opened = match location {
        StoreLocation::InMemory => duckdb::Connection::open_in_memory(),
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StatusError::StorageUnavailable(format!(
                        "cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            duckdb::Connection::open(path)
        }
    };
    opened.map_err(|e| StatusError::StorageUnavailable(e.to_string()))
}

fn storage(e: duckdb::Error) -> StatusError {
    tracing::error!("test store operation failed: {e}");
    StatusError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
