//! Single-flight job controller and the per-run ingestion pipeline.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use gamefeed_adapters::ContentSource;
use gamefeed_core::{
    AtomicCounter, ContentItem, ItemOutcome, JobPhase, JobStats, OutcomeCounts, RunReport, RunStatus, Stage,
};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::stages::{DetectionStage, StageError, SynthesisStage};
use crate::store::{DedupCheck, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Phase and live counters of the current (or most recent) run.
///
/// Every write happens under the phase lock and `snapshot` reads under it
/// too, so a snapshot never holds part of an item's updates.
#[derive(Debug)]
pub struct JobProgress {
    phase: Mutex<JobPhase>,
    phase_tx: watch::Sender<JobPhase>,
    items_found: AtomicCounter,
    items_processed: AtomicCounter,
    candidates_found: AtomicCounter,
    records_created: AtomicCounter,
    items_failed: AtomicCounter,
}

impl JobProgress {
    fn new() -> Self {
        let (phase_tx, _) = watch::channel(JobPhase::Idle);
        Self {
            phase: Mutex::new(JobPhase::Idle),
            phase_tx,
            items_found: AtomicCounter::new(),
            items_processed: AtomicCounter::new(),
            candidates_found: AtomicCounter::new(),
            records_created: AtomicCounter::new(),
            items_failed: AtomicCounter::new(),
        }
    }

    /// Zeroes the counters and enters `Running`, unless already running.
    fn begin(&self) -> bool {
        let mut phase = lock(&self.phase);
        if *phase == JobPhase::Running {
            return false;
        }
        self.items_found.reset();
        self.items_processed.reset();
        self.candidates_found.reset();
        self.records_created.reset();
        self.items_failed.reset();
        *phase = JobPhase::Running;
        self.phase_tx.send_replace(JobPhase::Running);
        true
    }

    fn end(&self) {
        let mut phase = lock(&self.phase);
        *phase = JobPhase::Idle;
        self.phase_tx.send_replace(JobPhase::Idle);
    }

    fn update(&self, apply: impl FnOnce(&Self)) {
        let _phase = lock(&self.phase);
        apply(self);
    }

    fn snapshot(&self) -> JobStats {
        let phase = lock(&self.phase);
        JobStats {
            phase: *phase,
            items_found: self.items_found.get(),
            items_processed: self.items_processed.get(),
            candidates_found: self.candidates_found.get(),
            records_created: self.records_created.get(),
            items_failed: self.items_failed.get(),
        }
    }
}

/// URLs already taken by an item of the current run.
type Claims = Mutex<HashSet<String>>;

pub struct IngestPipeline {
    source: Arc<dyn ContentSource>,
    detection: DetectionStage,
    dedup: DedupCheck,
    synthesis: SynthesisStage,
    item_concurrency: usize,
    fetch_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn ContentSource>,
        detection: DetectionStage,
        dedup: DedupCheck,
        synthesis: SynthesisStage,
    ) -> Self {
        Self {
            source,
            detection,
            dedup,
            synthesis,
            item_concurrency: 1,
            fetch_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_item_concurrency(mut self, item_concurrency: usize) -> Self {
        self.item_concurrency = item_concurrency.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn dedup(&self) -> &DedupCheck {
        &self.dedup
    }

    pub fn synthesis(&self) -> &SynthesisStage {
        &self.synthesis
    }

    async fn fetch(&self) -> Result<Vec<ContentItem>, String> {
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch_batch()).await {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "content fetch timed out after {}s",
                self.fetch_timeout.as_secs()
            )),
        }
    }

    async fn run(&self, progress: &JobProgress) -> (RunStatus, u64, OutcomeCounts) {
        let items = match self.fetch().await {
            Ok(items) => items,
            Err(reason) => {
                error!(source_id = self.source.source_id(), %reason, "content fetch failed, aborting run");
                return (RunStatus::FetchFailed { reason }, 0, OutcomeCounts::default());
            }
        };

        let found = items.len() as u64;
        progress.update(|p| {
            p.items_found.increment(found);
        });
        info!(items = found, "content batch fetched");

        let claims = Claims::default();
        let claims = &claims;
        let mut outcomes = OutcomeCounts::default();
        let mut results = stream::iter(items)
            .map(|item| async move { self.process_item(&item, progress, claims).await })
            .buffer_unordered(self.item_concurrency);
        while let Some(outcome) = results.next().await {
            outcomes.record(&outcome);
        }

        (RunStatus::Completed, found, outcomes)
    }

    /// Runs one item through detection, dedup and synthesis. Never fails:
    /// stage errors become `ItemOutcome::Failed`.
    async fn process_item(&self, item: &ContentItem, progress: &JobProgress, claims: &Claims) -> ItemOutcome {
        let outcome = self.item_outcome(item, progress, claims).await;
        if let ItemOutcome::Failed { stage, reason } = &outcome {
            progress.update(|p| {
                p.items_failed.incr();
            });
            warn!(title = %item.title, ?stage, %reason, "item failed");
        }
        outcome
    }

    async fn item_outcome(&self, item: &ContentItem, progress: &JobProgress, claims: &Claims) -> ItemOutcome {
        let detection = self.detection.detect(item).await;
        let candidate = detection
            .as_ref()
            .ok()
            .and_then(|d| d.candidate_url())
            .map(str::to_string);
        progress.update(|p| {
            p.items_processed.incr();
            if candidate.is_some() {
                p.candidates_found.incr();
            }
        });

        if let Err(err) = detection {
            return failed(Stage::Detection, err);
        }
        let Some(url) = candidate else {
            return ItemOutcome::NoCandidate;
        };

        if !lock(claims).insert(url.clone()) {
            info!(%url, "candidate already handled in this run");
            return ItemOutcome::Duplicate { url };
        }

        match self.dedup.exists_by_url(&url).await {
            Ok(true) => {
                info!(%url, "candidate already stored");
                return ItemOutcome::Duplicate { url };
            }
            Ok(false) => {}
            Err(err) => return failed(Stage::Dedup, err),
        }

        let created = self
            .synthesis
            .synthesize(&url, |_| {
                progress.update(|p| {
                    p.records_created.incr();
                })
            })
            .await;
        match created {
            Ok(Some(record)) => ItemOutcome::Created {
                record_id: record.id,
                url,
            },
            Ok(None) => ItemOutcome::Declined { url },
            Err(StageError::Store(StoreError::DuplicateUrl(_))) => ItemOutcome::Duplicate { url },
            Err(err) => failed(Stage::Synthesis, err),
        }
    }
}

fn failed(stage: Stage, err: impl std::fmt::Display) -> ItemOutcome {
    ItemOutcome::Failed {
        stage,
        reason: err.to_string(),
    }
}

/// Owns the job state of one process. At most one run is in flight.
pub struct JobController {
    pipeline: Arc<IngestPipeline>,
    progress: JobProgress,
    last_run: Mutex<Option<RunReport>>,
}

impl JobController {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            progress: JobProgress::new(),
            last_run: Mutex::new(None),
        })
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Starts a background run unless one is already in flight.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.progress.begin() {
            return false;
        }
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run_worker().await });
        true
    }

    pub fn stats(&self) -> JobStats {
        self.progress.snapshot()
    }

    pub fn last_run(&self) -> Option<RunReport> {
        lock(&self.last_run).clone()
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.progress.phase_tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|phase| *phase == JobPhase::Idle).await;
    }

    async fn run_worker(self: Arc<Self>) {
        let _idle = IdleGuard(Arc::clone(&self));
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let (status, items_found, outcomes) = self
            .pipeline
            .run(&self.progress)
            .instrument(info_span!("ingest_run", %run_id))
            .await;

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            items_found,
            outcomes,
        };
        info!(
            %run_id,
            items = report.items_found,
            created = report.outcomes.created,
            failed = report.outcomes.failed,
            "ingest run finished"
        );
        *lock(&self.last_run) = Some(report);
    }
}

/// Returns the controller to `Idle` when the worker ends, including by panic.
struct IdleGuard(Arc<JobController>);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.0.progress.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_zeroes_counters_and_refuses_a_second_run() {
        let progress = JobProgress::new();
        assert!(progress.begin());
        progress.update(|p| {
            p.items_found.increment(3);
            p.items_processed.incr();
            p.candidates_found.incr();
            p.records_created.incr();
            p.items_failed.incr();
        });
        assert!(!progress.begin());
        assert_eq!(progress.snapshot().items_found, 3);

        progress.end();
        assert!(progress.begin());
        let stats = progress.snapshot();
        assert_eq!(stats.phase, JobPhase::Running);
        assert_eq!(
            stats,
            JobStats {
                phase: JobPhase::Running,
                ..JobStats::default()
            }
        );
    }

    #[test]
    fn snapshots_never_split_an_update() {
        let progress = Arc::new(JobProgress::new());
        progress.begin();

        let writer = {
            let progress = Arc::clone(&progress);
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    progress.update(|p| {
                        p.items_processed.incr();
                        p.candidates_found.incr();
                    });
                }
            })
        };
        while !writer.is_finished() {
            let stats = progress.snapshot();
            assert_eq!(stats.items_processed, stats.candidates_found);
        }
        writer.join().unwrap();
        assert_eq!(progress.snapshot().candidates_found, 20_000);
    }
}
