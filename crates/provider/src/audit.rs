//! Fire-and-forget audit trail for tuple changes.
//!
//! [`Audited`] wraps any [`TupleStore`]; after a successful write it hands
//! one [`AuditRecord`] per changed tuple to an [`AuditDispatcher`]. The
//! dispatcher owns a bounded queue drained by a dedicated thread, so
//! recording never blocks the caller and never fails the write. A full
//! queue drops the record.

use crate::{TupleDelta, TupleStore};
use async_trait::async_trait;
use custos_core::error::{CustosError, CustosResult};
use custos_core::Tuple;
use serde::Serialize;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Write,
    Delete,
}

/// One tuple change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub at_ms: u64,
    pub action: AuditAction,
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl AuditRecord {
    fn new(action: AuditAction, tuple: &Tuple, at_ms: u64) -> Self {
        Self {
            at_ms,
            action,
            user: tuple.user.clone(),
            relation: tuple.relation.clone(),
            object: tuple.object.clone(),
        }
    }

    /// Records for every tuple in `delta`, writes first.
    pub fn from_delta(delta: &TupleDelta) -> Vec<Self> {
        let at_ms = now_ms();
        delta
            .writes
            .iter()
            .map(|t| Self::new(AuditAction::Write, t, at_ms))
            .chain(
                delta
                    .deletes
                    .iter()
                    .map(|t| Self::new(AuditAction::Delete, t, at_ms)),
            )
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Newline-delimited JSON writer for audit records.
pub struct NdjsonWriter<W: Write> {
    writer: BufWriter<W>,
    rows_written: usize,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(16 * 1024, writer),
            rows_written: 0,
        }
    }

    /// Serializes one record and flushes, so a crash loses at most the
    /// record in flight.
    pub fn write_record(&mut self, record: &AuditRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record).map_err(io::Error::other)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}

/// Sending half of the audit queue. Cheap to clone.
#[derive(Clone)]
pub struct AuditDispatcher {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditDispatcher {
    /// Starts the drain thread. With `ndjson_path` set, records are also
    /// appended to that file.
    pub fn spawn(capacity: usize, ndjson_path: Option<&Path>) -> CustosResult<Self> {
        let mut sink = match ndjson_path {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).map_err(|e| {
                        CustosError::Persistence(format!("create {}: {e}", dir.display()))
                    })?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        CustosError::Persistence(format!("open audit log {}: {e}", path.display()))
                    })?;
                Some(NdjsonWriter::new(file))
            }
            None => None,
        };

        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));
        std::thread::Builder::new()
            .name("custos-audit".into())
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    tracing::info!(
                        target: "audit",
                        action = ?record.action,
                        user = %record.user,
                        relation = %record.relation,
                        object = %record.object,
                        "tuple changed"
                    );
                    if let Some(w) = sink.as_mut() {
                        if let Err(e) = w.write_record(&record) {
                            tracing::warn!(error = %e, "failed to append audit record");
                        }
                    }
                }
                tracing::debug!("audit queue closed");
            })
            .map_err(|e| CustosError::Internal(format!("spawn audit thread: {e}")))?;

        Ok(Self { tx })
    }

    /// Dispatcher backed by a caller-owned receiver. Used by tests.
    pub fn from_sender(tx: mpsc::Sender<AuditRecord>) -> Self {
        Self { tx }
    }

    /// Enqueues without waiting.
    pub fn record(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(r)) => {
                tracing::warn!(object = %r.object, relation = %r.relation, "audit queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("audit queue closed, dropping record");
            }
        }
    }
}

/// [`TupleStore`] wrapper that audits successful writes.
pub struct Audited<S: ?Sized> {
    inner: Arc<S>,
    audit: AuditDispatcher,
}

impl<S: TupleStore + ?Sized> Audited<S> {
    pub fn new(inner: Arc<S>, audit: AuditDispatcher) -> Self {
        Self { inner, audit }
    }
}

#[async_trait]
impl<S: TupleStore + ?Sized> TupleStore for Audited<S> {
    async fn write(&self, delta: &TupleDelta) -> CustosResult<()> {
        self.inner.write(delta).await?;
        for record in AuditRecord::from_delta(delta) {
            self.audit.record(record);
        }
        Ok(())
    }

    async fn check(&self, user: &str, relation: &str, object: &str) -> bool {
        self.inner.check(user, relation, object).await
    }

    async fn list_objects(&self, user: &str, relation: &str, object_type: &str) -> Vec<String> {
        self.inner.list_objects(user, relation, object_type).await
    }

    async fn check_with_context(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> bool {
        self.inner
            .check_with_context(user, relation, object, contextual)
            .await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTupleStore;

    #[tokio::test]
    async fn successful_write_emits_one_record_per_tuple() {
        let (tx, mut rx) = mpsc::channel(8);
        let store = Audited::new(
            Arc::new(MemoryTupleStore::with_tuples([Tuple::public("d1")])),
            AuditDispatcher::from_sender(tx),
        );

        let delta = TupleDelta::write([Tuple::owner("alice", "d1"), Tuple::blocked("bob", "d1")])
            .and_delete([Tuple::public("d1")]);
        store.write(&delta).await.unwrap();

        let mut actions = Vec::new();
        while let Ok(r) = rx.try_recv() {
            actions.push((r.action, r.relation));
        }
        assert_eq!(
            actions,
            vec![
                (AuditAction::Write, "owner".to_string()),
                (AuditAction::Write, "blocked".to_string()),
                (AuditAction::Delete, "viewer".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_write_emits_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let inner = Arc::new(MemoryTupleStore::new());
        inner.set_fail_writes(true);
        let store = Audited::new(inner, AuditDispatcher::from_sender(tx));

        assert!(store
            .write(&TupleDelta::write([Tuple::owner("alice", "d1")]))
            .await
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let audit = AuditDispatcher::from_sender(tx);
        let delta = TupleDelta::write([Tuple::owner("a", "d1"), Tuple::owner("a", "d2")]);
        for record in AuditRecord::from_delta(&delta) {
            audit.record(record);
        }
    }

    #[test]
    fn ndjson_writer_emits_one_line_per_record() {
        let mut buf = Vec::new();
        {
            let mut w = NdjsonWriter::new(&mut buf);
            let delta = TupleDelta::delete([Tuple::guardian("bob", "alice")]);
            for r in AuditRecord::from_delta(&delta) {
                w.write_record(&r).unwrap();
            }
            assert_eq!(w.rows_written(), 1);
        }
        let line = String::from_utf8(buf).unwrap();
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["action"], "delete");
        assert_eq!(v["user"], "user:bob");
        assert_eq!(v["object"], "user:alice");
    }

    #[tokio::test]
    async fn spawned_dispatcher_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/log.ndjson");
        let audit = AuditDispatcher::spawn(16, Some(&path)).unwrap();
        for r in AuditRecord::from_delta(&TupleDelta::write([Tuple::member("carol", "o1")])) {
            audit.record(r);
        }
        drop(audit);

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&path).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(contents.contains("\"relation\":\"member\""));
    }
}
