use std::time::Duration;

use libsql::params;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::Memory;

use super::connection::Database;
use super::row;

/// High-frequency metadata mutations that must not block the caller on a
/// full fsync of their own. `insert`/`bump_access` go through this queue;
/// everything else in the metadata store writes synchronously.
pub(crate) enum WriteOp {
    Insert(Memory, oneshot::Sender<Result<()>>),
    BumpAccess(String, oneshot::Sender<Result<()>>),
}

const QUEUE_CAPACITY: usize = 5_000;
const BATCH_CAP: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

pub struct WriteQueue {
    sender: Mutex<Option<mpsc::Sender<WriteOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn spawn(db: Database) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let writer = tokio::spawn(run_writer(db, receiver));
        Self { sender: Mutex::new(Some(sender)), writer: Mutex::new(Some(writer)) }
    }

    async fn sender(&self) -> Option<mpsc::Sender<WriteOp>> {
        self.sender.lock().await.clone()
    }

    /// Enqueues an insert. Falls back to a direct synchronous write if the
    /// queue is at capacity or already closed, per the bounded-queue-with-
    /// overflow contract.
    pub async fn insert(&self, db: &Database, memory: Memory) -> Result<()> {
        let Some(sender) = self.sender().await else {
            return insert_sync(db, &memory).await;
        };
        let (tx, rx) = oneshot::channel();
        match sender.try_send(WriteOp::Insert(memory.clone(), tx)) {
            Ok(()) => rx.await.unwrap_or(Err(crate::error::EngineError::StorageError(
                libsql::Error::ConnectionFailed("write queue dropped".into()),
            ))),
            Err(_) => insert_sync(db, &memory).await,
        }
    }

    pub async fn bump_access(&self, db: &Database, id: &str) -> Result<()> {
        let Some(sender) = self.sender().await else {
            return bump_access_sync(db, id).await;
        };
        let (tx, rx) = oneshot::channel();
        match sender.try_send(WriteOp::BumpAccess(id.to_string(), tx)) {
            Ok(()) => rx.await.unwrap_or(Err(crate::error::EngineError::StorageError(
                libsql::Error::ConnectionFailed("write queue dropped".into()),
            ))),
            Err(_) => bump_access_sync(db, id).await,
        }
    }

    /// Stops accepting new writes and waits for the writer task to flush
    /// whatever is still queued, then exit. Idempotent — a second call
    /// finds nothing left to close and returns immediately.
    pub async fn close(&self) {
        self.sender.lock().await.take();
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "write queue writer task panicked during shutdown");
            }
        }
    }
}

async fn run_writer(db: Database, mut receiver: mpsc::Receiver<WriteOp>) {
    let mut batch = Vec::with_capacity(BATCH_CAP);
    let mut deadline = Instant::now() + FLUSH_INTERVAL;

    loop {
        tokio::select! {
            op = receiver.recv() => {
                match op {
                    Some(op) => {
                        batch.push(op);
                        if batch.len() >= BATCH_CAP {
                            flush(&db, std::mem::take(&mut batch)).await;
                            deadline = Instant::now() + FLUSH_INTERVAL;
                        }
                    }
                    None => {
                        // Sender dropped (shutdown): flush whatever remains and exit.
                        flush(&db, std::mem::take(&mut batch)).await;
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => {
                flush(&db, std::mem::take(&mut batch)).await;
                deadline = Instant::now() + FLUSH_INTERVAL;
            }
        }
    }
}

async fn flush(db: &Database, batch: Vec<WriteOp>) {
    if batch.is_empty() {
        return;
    }

    let conn = match db.connect() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(error = %e, "write queue failed to acquire connection for flush");
            for op in batch {
                notify_failure(op, "connection acquisition failed");
            }
            return;
        }
    };

    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE").await {
        tracing::error!(error = %e, "write queue failed to open transaction");
        for op in batch {
            notify_failure(op, "transaction open failed");
        }
        return;
    }

    let mut results = Vec::with_capacity(batch.len());
    for op in batch {
        let outcome = match &op {
            WriteOp::Insert(memory, _) => insert_row(&conn, memory).await,
            WriteOp::BumpAccess(id, _) => bump_access_row(&conn, id).await,
        };
        results.push((op, outcome));
    }

    if let Err(e) = conn.execute_batch("COMMIT").await {
        tracing::error!(error = %e, "write queue failed to commit batch");
        for (op, _) in results {
            notify_failure(op, "commit failed");
        }
        return;
    }

    for (op, outcome) in results {
        notify(op, outcome);
    }
}

fn notify(op: WriteOp, outcome: Result<()>) {
    match op {
        WriteOp::Insert(_, tx) => {
            let _ = tx.send(outcome);
        }
        WriteOp::BumpAccess(_, tx) => {
            let _ = tx.send(outcome);
        }
    }
}

fn notify_failure(op: WriteOp, reason: &str) {
    let err = crate::error::EngineError::StorageError(libsql::Error::ConnectionFailed(
        reason.to_string(),
    ));
    notify(op, Err(err));
}

async fn insert_row(conn: &libsql::Connection, memory: &Memory) -> Result<()> {
    conn.execute(row::INSERT_SQL, row::insert_params(memory)?)
        .await?;
    Ok(())
}

async fn bump_access_row(conn: &libsql::Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )
    .await?;
    Ok(())
}

async fn insert_sync(db: &Database, memory: &Memory) -> Result<()> {
    let conn = db.connect()?;
    insert_row(&conn, memory).await
}

async fn bump_access_sync(db: &Database, id: &str) -> Result<()> {
    let conn = db.connect()?;
    bump_access_row(&conn, id).await
}
