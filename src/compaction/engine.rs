//! The compaction worker.
//!
//! [`CompactionEngine`] owns everything a stage run needs: the outcome
//! store, the layer store, the oracle and the audit sink. `run_stage` runs
//! one transition for one stream; `run_cycle` walks every stream through
//! every transition; `run` repeats cycles in the background until
//! cancelled, waking early when ingestion signals new data.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEventType, AuditSink};
use crate::compaction::oracle::{ExtractOutput, FeatureExtractor, Oracle, OracleRequest};
use crate::compaction::scheduler::Scheduler;
use crate::compaction::stages::{self, Applied, Invocation, PromotionContext};
use crate::compaction::triggers;
use crate::config::Config;
use crate::core::knowledge::Finding;
use crate::core::outcome::StreamId;
use crate::error::{FailOpen, Result, StratumError};
use crate::service::cache::SnapshotCache;
use crate::storage::layers::{DeadLetter, LayerState, LayerStore, Transition};
use crate::storage::traits::OutcomeStore;

/// Why a stage run did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run holds the partition.
    Busy,
    /// A dead letter parks the partition.
    Parked(String),
    /// The trigger condition does not hold.
    NotDue,
}

/// Result of one stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped(SkipReason),
    Committed { cursor: u64, produced: u32 },
    DeadLettered { id: String },
    Cancelled,
}

impl StageOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, StageOutcome::Committed { .. })
    }
}

/// One stage run inside a cycle.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub transition: Transition,
    pub stream: StreamId,
    pub outcome: StageOutcome,
}

/// Everything a cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub runs: Vec<StageRun>,
    /// Stage runs that failed on storage rather than the oracle.
    pub errors: usize,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn committed(&self) -> usize {
        self.runs.iter().filter(|r| r.outcome.is_committed()).count()
    }

    pub fn dead_lettered(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::DeadLettered { .. }))
            .count()
    }
}

/// Drives the derivation stages.
pub struct CompactionEngine {
    config: Config,
    outcomes: Arc<dyn OutcomeStore>,
    layers: Arc<LayerStore>,
    oracle: Arc<dyn Oracle>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    audit: Arc<dyn AuditSink>,
    cache: Option<Arc<SnapshotCache>>,
    scheduler: Scheduler,
}

impl CompactionEngine {
    pub fn new(
        config: Config,
        outcomes: Arc<dyn OutcomeStore>,
        layers: Arc<LayerStore>,
        oracle: Arc<dyn Oracle>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            outcomes,
            layers,
            oracle,
            extractor: None,
            audit,
            cache: None,
            scheduler: Scheduler::new(),
        }
    }

    /// Feature extractor for gold examples whose outcome carries no vector.
    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Cache to install new snapshots into after each promotion.
    pub fn with_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    /// Run one transition for one stream.
    ///
    /// With `force`, extraction and mining run on any non-empty batch
    /// regardless of their count and age thresholds. Promotion thresholds
    /// always apply.
    pub async fn run_stage(
        &self,
        transition: Transition,
        stream: &StreamId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let Some(_guard) = self.scheduler.try_begin(transition, stream) else {
            return Ok(StageOutcome::Skipped(SkipReason::Busy));
        };

        let state = self.layers.state()?;
        if let Some(letter) = state.parked(transition, stream) {
            tracing::debug!(%transition, %stream, dead_letter = %letter.id, "partition parked");
            return Ok(StageOutcome::Skipped(SkipReason::Parked(letter.id.clone())));
        }
        drop(state);

        self.dispatch(transition, stream, force, cancel).await
    }

    /// Run a transition. The caller holds the partition guard.
    async fn dispatch(
        &self,
        transition: Transition,
        stream: &StreamId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        match transition {
            Transition::Extract => self.extract(stream, force, cancel).await,
            Transition::Mine => self.mine(stream, force, cancel).await,
            Transition::Promote => self.promote(stream, cancel).await,
        }
    }

    async fn extract(
        &self,
        stream: &StreamId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let state = self.layers.state()?;
        let cursor = state.cursor(Transition::Extract, stream);
        let records = self
            .outcomes
            .read_since(stream, cursor.position, self.config.worker.batch_limit)?;
        let now = Utc::now();
        let grace = chrono::Duration::minutes(i64::from(self.config.worker.pending_grace_minutes));
        let batch = triggers::collect_outcomes(cursor.position, records, now, grace);

        if batch.records.is_empty() {
            if batch.abandoned.is_empty() {
                return Ok(StageOutcome::Skipped(SkipReason::NotDue));
            }
            // Only dead pending records: step past them without the oracle.
            let empty = ExtractOutput { findings: vec![] };
            return self.commit(Transition::Extract, stream, |s| {
                stages::apply_extraction(s, stream, &batch, empty, now)
            });
        }
        if !force && !triggers::extraction_due(&batch, &cursor, &self.config.triggers, now) {
            return Ok(StageOutcome::Skipped(SkipReason::NotDue));
        }

        let request = OracleRequest::Extract {
            stream: stream.clone(),
            existing_findings: state.active_findings(stream).into_iter().cloned().collect(),
            batch: batch.records.clone(),
        };
        drop(state);

        let records = batch.records.clone();
        let output = match self
            .invoke(Transition::Extract, stream, &request, cancel, batch.from, batch.to, |v| {
                stages::parse_extraction(v, &records)
            })
            .await?
        {
            Ok(output) => output,
            Err(outcome) => return Ok(outcome),
        };

        self.commit(Transition::Extract, stream, |s| {
            stages::apply_extraction(s, stream, &batch, output, Utc::now())
        })
    }

    async fn mine(
        &self,
        stream: &StreamId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let state = self.layers.state()?;
        let cursor = state.cursor(Transition::Mine, stream);
        let findings: Vec<Finding> = triggers::collect_findings(&state, stream, &cursor)
            .into_iter()
            .cloned()
            .collect();

        let due = if force {
            !findings.is_empty()
        } else {
            triggers::mining_due(findings.len(), &self.config.triggers)
        };
        if !due {
            return Ok(StageOutcome::Skipped(SkipReason::NotDue));
        }

        let to = findings.iter().map(|f| f.seq).max().unwrap_or(cursor.position);
        let known: HashSet<String> = state
            .active_findings(stream)
            .into_iter()
            .map(|f| f.id.clone())
            .collect();
        let request = OracleRequest::Mine {
            stream: stream.clone(),
            existing_patterns: state.patterns_of(stream).into_iter().cloned().collect(),
            findings,
        };
        drop(state);

        let output = match self
            .invoke(Transition::Mine, stream, &request, cancel, cursor.position, to, |v| {
                stages::parse_mining(v, &known)
            })
            .await?
        {
            Ok(output) => output,
            Err(outcome) => return Ok(outcome),
        };

        let mining = &self.config.mining;
        self.commit(Transition::Mine, stream, |s| {
            stages::apply_mining(s, stream, to, output, mining, Utc::now())
        })
    }

    async fn promote(&self, stream: &StreamId, cancel: &CancellationToken) -> Result<StageOutcome> {
        let state = self.layers.state()?;
        let cursor = state.cursor(Transition::Promote, stream);
        let batch = triggers::collect_patterns(&state, stream, &cursor, &self.config.triggers);
        if batch.patterns.is_empty() {
            return Ok(StageOutcome::Skipped(SkipReason::NotDue));
        }

        let cited: HashSet<&String> = batch.patterns.iter().flat_map(|p| &p.finding_ids).collect();
        let request = OracleRequest::Promote {
            stream: stream.clone(),
            patterns: batch.patterns.clone(),
            findings: state
                .active_findings(stream)
                .into_iter()
                .filter(|f| cited.contains(&f.id))
                .cloned()
                .collect(),
            entries: state
                .entries
                .values()
                .filter(|e| e.engine == stream.engine)
                .cloned()
                .collect(),
            examples: state
                .examples
                .values()
                .filter(|g| g.engine == stream.engine)
                .cloned()
                .collect(),
        };
        drop(state);

        let output = match self
            .invoke(Transition::Promote, stream, &request, cancel, batch.from, batch.to, |v| {
                stages::parse_promotion(v)
            })
            .await?
        {
            Ok(output) => output,
            Err(outcome) => return Ok(outcome),
        };

        let ctx = PromotionContext {
            config: &self.config,
            vocabulary: self.layers.vocabulary(),
            outcomes: self.outcomes.as_ref(),
            extractor: self.extractor.as_deref(),
        };
        let committed = self.commit(Transition::Promote, stream, |s| {
            stages::apply_promotion(s, &ctx, stream, &batch, output, Utc::now())
        })?;

        if matches!(committed, StageOutcome::Committed { produced, .. } if produced > 0) {
            self.publish(&stream.engine);
        }
        Ok(committed)
    }

    /// Build the engine's snapshot and hand it to the cache.
    fn publish(&self, engine: &str) {
        match self.layers.publish(engine) {
            Ok(snapshot) => {
                tracing::info!(engine, version = %snapshot.version, "snapshot published");
                if let Some(cache) = &self.cache {
                    cache.install(snapshot);
                }
            }
            Err(e) => tracing::warn!(engine, error = %e, "snapshot publish failed"),
        }
    }

    /// Invoke the oracle with retries. A batch that exhausts its attempts
    /// is parked as a dead letter.
    ///
    /// The inner `Err` carries the outcome to return instead of output.
    #[allow(clippy::too_many_arguments)]
    async fn invoke<T>(
        &self,
        transition: Transition,
        stream: &StreamId,
        request: &OracleRequest,
        cancel: &CancellationToken,
        from: u64,
        to: u64,
        parse: impl Fn(serde_json::Value) -> Result<T>,
    ) -> Result<std::result::Result<T, StageOutcome>> {
        let invocation = stages::invoke_with_retry(
            self.oracle.as_ref(),
            request,
            &self.config.retry,
            transition,
            stream,
            self.audit.as_ref(),
            cancel,
            parse,
        )
        .await;

        match invocation {
            Invocation::Parsed(output) => Ok(Ok(output)),
            Invocation::Cancelled => {
                tracing::info!(%transition, %stream, "stage cancelled between attempts");
                Ok(Err(StageOutcome::Cancelled))
            }
            Invocation::Exhausted {
                attempts,
                last_error,
            } => {
                let letter = DeadLetter {
                    id: String::new(),
                    transition,
                    engine: stream.engine.clone(),
                    benchmark: stream.benchmark.clone(),
                    from_position: from,
                    to_position: to,
                    attempts,
                    last_error: last_error.clone(),
                    created_at: Utc::now(),
                };
                let id = self.layers.transact(|s| Ok(s.add_dead_letter(letter)))?;
                tracing::error!(
                    %transition,
                    %stream,
                    dead_letter = %id,
                    attempts,
                    error = %last_error,
                    "batch parked"
                );
                self.audit.record(AuditEventType::dead_lettered(
                    id.clone(),
                    transition,
                    stream,
                    attempts,
                    last_error,
                ));
                Ok(Err(StageOutcome::DeadLettered { id }))
            }
        }
    }

    /// Apply stage output and the cursor in one transaction, then audit.
    fn commit(
        &self,
        transition: Transition,
        stream: &StreamId,
        apply: impl FnOnce(&mut LayerState) -> Result<Applied>,
    ) -> Result<StageOutcome> {
        let applied = self.layers.transact(apply)?;
        for event in applied.audit {
            self.audit.record(event);
        }
        tracing::info!(
            %transition,
            %stream,
            cursor = applied.cursor,
            produced = applied.produced,
            "stage committed"
        );
        self.audit.record(AuditEventType::committed(
            transition,
            stream,
            applied.cursor,
            applied.produced,
        ));
        Ok(StageOutcome::Committed {
            cursor: applied.cursor,
            produced: applied.produced,
        })
    }

    /// Walk every stream through every transition once.
    ///
    /// Cancellation is checked between stage runs; committed work stays
    /// committed and the next cycle resumes from the cursors.
    pub async fn run_cycle(&self, force: bool, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let streams = self.outcomes.streams()?;

        'streams: for stream in streams {
            for transition in Transition::ALL {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'streams;
                }
                match self.run_stage(transition, &stream, force, cancel).await {
                    Ok(outcome) => report.runs.push(StageRun {
                        transition,
                        stream: stream.clone(),
                        outcome,
                    }),
                    Err(e) => {
                        tracing::warn!(%transition, %stream, error = %e, "stage run failed");
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Release a dead letter and rerun its batch, bypassing count triggers.
    ///
    /// The letter is put back when the rerun commits nothing: the partition
    /// was busy, nothing was due, the run was cancelled or storage failed.
    pub async fn retry_dead_letter(&self, id: &str, cancel: &CancellationToken) -> Result<StageOutcome> {
        let letter = self
            .layers
            .state()?
            .dead_letters
            .get(id)
            .cloned()
            .ok_or_else(|| StratumError::not_found("dead letter", id))?;
        let stream = letter.stream();

        let Some(_guard) = self.scheduler.try_begin(letter.transition, &stream) else {
            return Ok(StageOutcome::Skipped(SkipReason::Busy));
        };

        self.layers.transact(|s| {
            s.remove_dead_letter(id)
                .ok_or_else(|| StratumError::not_found("dead letter", id))
        })?;
        tracing::info!(dead_letter = id, transition = %letter.transition, "dead letter released");
        self.audit.record(AuditEventType::DeadLetterReleased { id: id.to_string() });

        let outcome = self.dispatch(letter.transition, &stream, true, cancel).await;
        let rerun = matches!(
            outcome,
            Ok(StageOutcome::Committed { .. }) | Ok(StageOutcome::DeadLettered { .. })
        );
        if !rerun {
            tracing::warn!(dead_letter = id, "rerun committed nothing; dead letter reinstated");
            self.layers.transact(|s| {
                s.reinstate_dead_letter(letter);
                Ok(())
            })?;
        }
        outcome
    }

    /// Background loop: a cycle every `worker.interval_seconds`, or sooner
    /// when `wake` is notified. Returns once `cancel` fires.
    pub async fn run(self: Arc<Self>, wake: Arc<Notify>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.worker.interval_seconds.max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_seconds = period.as_secs(), "compaction worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("compaction worker stopping");
                    break;
                }
                _ = tick.tick() => {}
                _ = wake.notified() => {
                    tracing::debug!("compaction worker woken by ingest");
                }
            }

            let report = self
                .run_cycle(false, &cancel)
                .await
                .fail_open_default("compaction cycle failed");
            if report.committed() > 0 || report.dead_lettered() > 0 {
                tracing::info!(
                    committed = report.committed(),
                    dead_lettered = report.dead_lettered(),
                    errors = report.errors,
                    "compaction cycle finished"
                );
            }
        }
    }
}
