//! Write path: accept outcomes from producers.
//!
//! `ingest` validates synchronously and enqueues on a bounded channel; the
//! only back-pressure a producer sees is waiting for queue space. A single
//! writer task drains the queue in batches, appends each batch to the
//! outcome store on the blocking pool, and wakes the compaction worker.
//! The ack means "accepted and queued", not "durable"; `flush` waits until
//! everything queued before it has been written.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::IngestConfig;
use crate::core::features::FeatureVocabulary;
use crate::core::outcome::{Outcome, OutcomeKey};
use crate::error::{Result, StratumError};
use crate::storage::traits::OutcomeStore;

/// Acknowledgement that an outcome passed validation and was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub key: OutcomeKey,
}

enum Command {
    Append(Box<Outcome>),
    Flush(oneshot::Sender<Result<()>>),
}

/// Producer handle. Cheap to clone; the writer stops once every handle is
/// dropped and the queue is drained.
#[derive(Clone)]
pub struct IngestService {
    tx: mpsc::Sender<Command>,
    vocabulary: Arc<FeatureVocabulary>,
}

impl IngestService {
    /// Start the writer task and return a handle to feed it.
    ///
    /// `wake` is notified after every batch that stored something new.
    pub fn start(
        store: Arc<dyn OutcomeStore>,
        vocabulary: FeatureVocabulary,
        config: &IngestConfig,
        wake: Arc<Notify>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let writer = Writer {
            rx,
            store,
            wake,
            batch_size: config.batch_size.max(1),
            failed_since_flush: 0,
        };
        let handle = tokio::spawn(writer.run());
        (
            Self {
                tx,
                vocabulary: Arc::new(vocabulary),
            },
            handle,
        )
    }

    /// Validate an outcome and queue it for writing.
    ///
    /// Validation errors return immediately and nothing is queued.
    pub async fn ingest(&self, mut outcome: Outcome) -> Result<IngestAck> {
        outcome.validate(&self.vocabulary)?;
        let key = outcome.key();
        self.tx
            .send(Command::Append(Box::new(outcome)))
            .await
            .map_err(|_| StratumError::IngestClosed)?;
        Ok(IngestAck { key })
    }

    /// Wait until everything queued before this call is written.
    ///
    /// Fails if any write since the previous flush failed.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| StratumError::IngestClosed)?;
        wait.await.map_err(|_| StratumError::IngestClosed)?
    }

    /// Free queue slots right now.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

struct Writer {
    rx: mpsc::Receiver<Command>,
    store: Arc<dyn OutcomeStore>,
    wake: Arc<Notify>,
    batch_size: usize,
    failed_since_flush: usize,
}

impl Writer {
    async fn run(mut self) {
        tracing::debug!(batch_size = self.batch_size, "ingest writer started");
        while let Some(first) = self.rx.recv().await {
            let mut pending = Vec::new();
            let mut flushes = Vec::new();
            Self::sort(first, &mut pending, &mut flushes);
            while pending.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(cmd) => Self::sort(cmd, &mut pending, &mut flushes),
                    Err(_) => break,
                }
            }

            if !pending.is_empty() {
                self.write(pending).await;
            }

            for done in flushes {
                let result = match std::mem::take(&mut self.failed_since_flush) {
                    0 => Ok(()),
                    n => Err(StratumError::invalid_state(format!(
                        "{} outcome(s) failed to persist",
                        n
                    ))),
                };
                let _ = done.send(result);
            }
        }
        tracing::debug!("ingest writer stopped");
    }

    fn sort(cmd: Command, pending: &mut Vec<Outcome>, flushes: &mut Vec<oneshot::Sender<Result<()>>>) {
        match cmd {
            Command::Append(outcome) => pending.push(*outcome),
            Command::Flush(done) => flushes.push(done),
        }
    }

    async fn write(&mut self, batch: Vec<Outcome>) {
        let count = batch.len();
        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || {
            let mut stored = 0usize;
            let mut failed = 0usize;
            for outcome in batch {
                let key = outcome.key();
                match store.append(outcome) {
                    Ok(ack) if !ack.duplicate => stored += 1,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "outcome append failed");
                        failed += 1;
                    }
                }
            }
            (stored, failed)
        })
        .await;

        match written {
            Ok((stored, failed)) => {
                self.failed_since_flush += failed;
                tracing::debug!(count, stored, failed, "ingest batch written");
                if stored > 0 {
                    self.wake.notify_one();
                }
            }
            Err(e) => {
                tracing::error!(count, error = %e, "ingest batch task failed");
                self.failed_since_flush += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outcome::{fixtures, StoredOutcome, StreamId};
    use crate::storage::memory::MemoryOutcomeStore;
    use crate::storage::retention::{DailyRollup, RetentionReport};
    use crate::storage::traits::AppendAck;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn start(store: Arc<dyn OutcomeStore>, wake: Arc<Notify>) -> (IngestService, JoinHandle<()>) {
        IngestService::start(
            store,
            FeatureVocabulary::standard(),
            &IngestConfig {
                queue_capacity: 8,
                batch_size: 4,
            },
            wake,
        )
    }

    #[tokio::test]
    async fn test_ingest_then_flush_is_visible() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let (svc, _writer) = start(store.clone(), Arc::new(Notify::new()));

        for i in 0..10 {
            let ack = svc.ingest(fixtures::win(&format!("q{}", i), "r1")).await.unwrap();
            assert_eq!(ack.key.query_id, format!("q{}", i));
        }
        svc.flush().await.unwrap();

        assert_eq!(store.len().unwrap(), 10);
        assert_eq!(store.head(&StreamId::new("duckdb", "tpcds")).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_invalid_outcome_is_rejected_synchronously() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let (svc, _writer) = start(store.clone(), Arc::new(Notify::new()));

        let err = svc.ingest(fixtures::win("", "r1")).await.unwrap_err();
        assert!(err.is_caller_error());
        let err = svc
            .ingest(fixtures::win("q1", "r1").with_speedup(f64::NAN))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("speedup"));

        svc.flush().await.unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicates_are_acked_and_stored_once() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let (svc, _writer) = start(store.clone(), Arc::new(Notify::new()));
        svc.ingest(fixtures::win("q1", "r1")).await.unwrap();
        svc.ingest(fixtures::win("q1", "r1")).await.unwrap();
        svc.flush().await.unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_writer_wakes_compaction() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let wake = Arc::new(Notify::new());
        let (svc, _writer) = start(store, Arc::clone(&wake));

        svc.ingest(fixtures::win("q1", "r1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), wake.notified())
            .await
            .expect("compaction woken");
    }

    /// Store whose appends always fail.
    struct Broken;

    impl OutcomeStore for Broken {
        fn append(&self, _outcome: Outcome) -> Result<AppendAck> {
            Err(StratumError::invalid_state("disk gone"))
        }
        fn get(&self, _key: &OutcomeKey) -> Result<Option<StoredOutcome>> {
            Ok(None)
        }
        fn read_since(&self, _s: &StreamId, _after: u64, _limit: usize) -> Result<Vec<StoredOutcome>> {
            Ok(vec![])
        }
        fn streams(&self) -> Result<Vec<StreamId>> {
            Ok(vec![])
        }
        fn head(&self, _s: &StreamId) -> Result<u64> {
            Ok(0)
        }
        fn len(&self) -> Result<usize> {
            Ok(0)
        }
        fn apply_retention(&self, _now: DateTime<Utc>, _days: u32) -> Result<RetentionReport> {
            Ok(RetentionReport::default())
        }
        fn rollups(&self) -> Result<Vec<DailyRollup>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_failed_writes_surface_on_flush() {
        let store = Arc::new(Broken);
        let (svc, _writer) = start(store, Arc::new(Notify::new()));

        svc.ingest(fixtures::win("q1", "r1")).await.unwrap();
        assert!(svc.flush().await.is_err());
        // The failure is reported once
        assert!(svc.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_drop() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let (svc, writer) = start(store.clone(), Arc::new(Notify::new()));
        svc.ingest(fixtures::win("q1", "r1")).await.unwrap();
        drop(svc);
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer stopped")
            .unwrap();
        assert_eq!(store.len().unwrap(), 1, "queued outcome drained before exit");
    }

    #[tokio::test]
    async fn test_ingest_after_writer_exit_is_closed() {
        let store = Arc::new(MemoryOutcomeStore::new());
        let (svc, writer) = start(store, Arc::new(Notify::new()));
        writer.abort();
        let _ = writer.await;
        let err = svc.ingest(fixtures::win("q1", "r1")).await.unwrap_err();
        assert!(matches!(err, StratumError::IngestClosed));
    }
}
