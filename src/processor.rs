use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::adapter::SourceAdapter;
use crate::cache::{CacheService, namespace};
use crate::checkpoint::{Checkpoint, PageCursor, ResumeDecision, decide_resume, query_hash};
use crate::domain::{Gene, GeneId, IngestionMode, RunStatus, SourceName};
use crate::error::IngestError;
use crate::evidence::{FactPayload, RawFact};
use crate::gene::GeneNormalizer;
use crate::merge::merge_evidence;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scoring::ScoringEngine;
use crate::store::{ChunkCommit, EvidenceRepository, StagedFact};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Buffered facts that trigger a flush at the end of a page.
    pub chunk_size: usize,
    /// Approximate buffer size that forces a flush in the middle of a page.
    pub max_buffer_bytes: usize,
    /// Resident memory above which the run stops and saves its progress.
    pub memory_ceiling_bytes: Option<u64>,
    pub max_pages: Option<u32>,
    /// Consecutive already-known facts after which a smart run that started
    /// from the first page stops.
    pub duplicate_run_threshold: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            max_buffer_bytes: 8 * 1024 * 1024,
            memory_ceiling_bytes: None,
            max_pages: None,
            duplicate_run_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Idle,
    Resuming,
    Fetching,
    Buffering,
    Flushing,
    Draining,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessorState::Idle => "idle",
            ProcessorState::Resuming => "resuming",
            ProcessorState::Fetching => "fetching",
            ProcessorState::Buffering => "buffering",
            ProcessorState::Flushing => "flushing",
            ProcessorState::Draining => "draining",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source reported its last page.
    Exhausted,
    /// Smart mode reached previously ingested facts.
    DuplicateRun,
    PageLimit,
    ResourceLimit,
    Paused,
    Cancelled,
}

impl StopReason {
    fn final_status(self) -> RunStatus {
        match self {
            StopReason::Exhausted | StopReason::DuplicateRun => RunStatus::Completed,
            StopReason::PageLimit
            | StopReason::ResourceLimit
            | StopReason::Paused
            | StopReason::Cancelled => RunStatus::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub source: SourceName,
    pub mode: IngestionMode,
    pub resumed_from: Option<PageCursor>,
    pub restart_reason: Option<String>,
    pub pages: u32,
    pub facts: u64,
    pub duplicates: u64,
    pub genes_touched: usize,
    pub staged: u64,
    pub conflicts: u64,
    pub chunks: u32,
    pub early_flushes: u32,
    pub stop_reason: StopReason,
    pub status: RunStatus,
}

/// Cooperative pause/cancel flags, checked between pages.
#[derive(Debug, Default)]
pub struct RunControl {
    pause: AtomicBool,
    cancel: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Stops a run before memory use gets out of hand.
pub trait ResourceGuard: Send + Sync {
    /// `Some(description)` when the limit is exceeded.
    fn check(&self) -> Option<String>;
}

/// Resident set size from `/proc/self/status`. Never trips where that file
/// does not exist.
pub struct RssGuard {
    ceiling_bytes: u64,
}

impl RssGuard {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self { ceiling_bytes }
    }
}

impl ResourceGuard for RssGuard {
    fn check(&self) -> Option<String> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        let rss = parse_rss_bytes(&status)?;
        (rss > self.ceiling_bytes)
            .then(|| format!("resident memory {rss} bytes exceeds {} bytes", self.ceiling_bytes))
    }
}

pub fn parse_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[derive(Default)]
struct ChunkBuffer {
    genes: BTreeMap<GeneId, (Gene, Vec<FactPayload>)>,
    facts: usize,
    bytes: usize,
}

impl ChunkBuffer {
    fn push(&mut self, gene: Gene, fact: RawFact) {
        self.facts += 1;
        self.bytes += fact.approx_size();
        self.genes
            .entry(gene.id.clone())
            .or_insert_with(|| (gene, Vec::new()))
            .1
            .push(fact.payload);
    }

    fn take(&mut self) -> BTreeMap<GeneId, (Gene, Vec<FactPayload>)> {
        self.facts = 0;
        self.bytes = 0;
        std::mem::take(&mut self.genes)
    }
}

/// Mutable state of one source run.
struct Run {
    source: SourceName,
    mode: IngestionMode,
    state: ProcessorState,
    /// Last durably committed checkpoint.
    committed: Checkpoint,
    /// Next page to fetch.
    next_cursor: Option<PageCursor>,
    /// Progress counters ahead of `committed`.
    pages_completed: u32,
    items_processed: u64,
    total_pages: Option<u32>,
    buffer: ChunkBuffer,
    /// Stored plus buffered keys per gene, for smart-mode duplicate checks.
    known: HashMap<GeneId, BTreeSet<String>>,
    resolved: HashMap<String, Result<Gene, String>>,
    touched: BTreeSet<GeneId>,
    summary: RunSummary,
}

impl Run {
    fn enter(&mut self, state: ProcessorState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "processor state");
            self.state = state;
        }
    }

    fn event(&self, status: RunStatus, last_error: Option<String>) -> ProgressEvent {
        ProgressEvent {
            source_name: self.source.clone(),
            current_page: self.pages_completed,
            total_pages: self.total_pages,
            items_processed: self.items_processed,
            status,
            last_error,
        }
    }
}

/// Drives one adapter through fetch, buffer, merge and flush.
pub struct StreamingProcessor {
    repo: Arc<dyn EvidenceRepository>,
    normalizer: Arc<dyn GeneNormalizer>,
    reporter: Arc<dyn ProgressReporter>,
    scoring: Option<Arc<ScoringEngine>>,
    cache: Option<Arc<CacheService>>,
    guard: Option<Arc<dyn ResourceGuard>>,
    config: ProcessorConfig,
}

impl StreamingProcessor {
    pub fn new(
        repo: Arc<dyn EvidenceRepository>,
        normalizer: Arc<dyn GeneNormalizer>,
        reporter: Arc<dyn ProgressReporter>,
        config: ProcessorConfig,
    ) -> Self {
        let guard = config
            .memory_ceiling_bytes
            .map(|ceiling| Arc::new(RssGuard::new(ceiling)) as Arc<dyn ResourceGuard>);
        Self {
            repo,
            normalizer,
            reporter,
            scoring: None,
            cache: None,
            guard,
            config,
        }
    }

    pub fn with_scoring(mut self, scoring: Arc<ScoringEngine>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn ResourceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn run(
        &self,
        adapter: &dyn SourceAdapter,
        mode: IngestionMode,
        control: &RunControl,
    ) -> Result<RunSummary, IngestError> {
        let source = adapter.source();
        let span = info_span!("ingest", source = %source, mode = %mode);
        let _enter = span.enter();

        let mut run = self.resume(adapter, mode)?;
        let result = self
            .drive(adapter, &mut run, control)
            .and_then(|stop_reason| self.finish(&mut run, stop_reason));
        if let Err(err) = &result {
            self.fail(&mut run, err);
        }
        result
    }

    fn resume(&self, adapter: &dyn SourceAdapter, mode: IngestionMode) -> Result<Run, IngestError> {
        let source = adapter.source();
        let hash = query_hash(&adapter.query_fingerprint());
        let stored = self.repo.load_checkpoint(&source)?;

        let (mut checkpoint, resumed_from, restart_reason) =
            match decide_resume(stored.as_ref(), mode, &hash) {
                ResumeDecision::Resume(checkpoint) => {
                    let cursor = checkpoint.cursor.clone();
                    info!(cursor = ?cursor, pages = checkpoint.pages_completed, "resuming from checkpoint");
                    (checkpoint, cursor, None)
                }
                ResumeDecision::Restart(reason) => {
                    info!(reason = %reason, "starting from the first page");
                    let checkpoint =
                        Checkpoint::start(source.clone(), mode, hash, adapter.first_cursor());
                    (checkpoint, None, Some(reason.to_string()))
                }
            };
        checkpoint.status = RunStatus::Running;
        checkpoint.last_error = None;
        checkpoint.updated_at = Utc::now();
        self.repo.save_checkpoint(&checkpoint)?;

        let run = Run {
            source: source.clone(),
            mode,
            state: ProcessorState::Resuming,
            pages_completed: checkpoint.pages_completed,
            items_processed: checkpoint.items_processed,
            total_pages: checkpoint.total_pages,
            next_cursor: checkpoint.cursor.clone(),
            committed: checkpoint,
            buffer: ChunkBuffer::default(),
            known: HashMap::new(),
            resolved: HashMap::new(),
            touched: BTreeSet::new(),
            summary: RunSummary {
                source,
                mode,
                resumed_from,
                restart_reason,
                pages: 0,
                facts: 0,
                duplicates: 0,
                genes_touched: 0,
                staged: 0,
                conflicts: 0,
                chunks: 0,
                early_flushes: 0,
                stop_reason: StopReason::Exhausted,
                status: RunStatus::Running,
            },
        };
        self.reporter.publish(run.event(RunStatus::Running, None));
        Ok(run)
    }

    fn drive(
        &self,
        adapter: &dyn SourceAdapter,
        run: &mut Run,
        control: &RunControl,
    ) -> Result<StopReason, IngestError> {
        let mut duplicate_run = 0usize;
        // A resumed run may replay a chunk whose checkpoint was lost, so
        // known facts there do not mark the end of new data.
        let stop_on_known = run.summary.resumed_from.is_none();

        loop {
            if control.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if control.is_paused() {
                return Ok(StopReason::Paused);
            }
            if let Some(max_pages) = self.config.max_pages {
                if run.summary.pages >= max_pages {
                    return Ok(StopReason::PageLimit);
                }
            }
            if let Some(reason) = self.guard.as_ref().and_then(|guard| guard.check()) {
                warn!(reason = %reason, "resource limit reached; saving progress");
                return Ok(StopReason::ResourceLimit);
            }
            let Some(current) = run.next_cursor.clone() else {
                return Ok(StopReason::Exhausted);
            };

            run.enter(ProcessorState::Fetching);
            let page = adapter.next_page(&current)?;
            run.summary.pages += 1;
            if page.total_pages.is_some() {
                run.total_pages = page.total_pages;
            }
            debug!(cursor = %current, facts = page.facts.len(), done = page.done, "page fetched");

            run.enter(ProcessorState::Buffering);
            let mut reached_known = false;
            let page_start_items = run.items_processed;
            for fact in page.facts {
                run.items_processed += 1;
                let Some(gene) = self.resolve(run, &fact)? else {
                    continue;
                };
                if run.mode == IngestionMode::Smart && self.is_known(run, &gene.id, &fact)? {
                    run.summary.duplicates += 1;
                    duplicate_run += 1;
                    if stop_on_known && duplicate_run >= self.config.duplicate_run_threshold {
                        reached_known = true;
                    }
                    continue;
                }
                duplicate_run = 0;
                run.known
                    .entry(gene.id.clone())
                    .or_default()
                    .insert(fact.payload.key().to_string());
                run.buffer.push(gene, fact);
                run.summary.facts += 1;

                if run.buffer.bytes >= self.config.max_buffer_bytes {
                    // The page is not finished: the checkpoint keeps pointing
                    // at it and a resumed run fetches it again.
                    info!(
                        bytes = run.buffer.bytes,
                        ceiling = self.config.max_buffer_bytes,
                        "buffer ceiling reached; flushing early"
                    );
                    run.summary.early_flushes += 1;
                    self.flush(
                        run,
                        Some(current.clone()),
                        page_start_items,
                        RunStatus::Running,
                    )?;
                    run.enter(ProcessorState::Buffering);
                }
            }

            run.pages_completed += 1;
            run.next_cursor = if page.done { None } else { page.next_cursor };
            if reached_known {
                info!(duplicates = duplicate_run, "reached previously ingested facts");
                run.next_cursor = None;
            }

            if run.buffer.facts >= self.config.chunk_size {
                let cursor = run.next_cursor.clone();
                let items = run.items_processed;
                self.flush(run, cursor, items, RunStatus::Running)?;
            }
            self.reporter.publish(run.event(RunStatus::Running, None));

            if reached_known {
                return Ok(StopReason::DuplicateRun);
            }
        }
    }

    /// Maps the fact's subject to a canonical gene, staging it for review
    /// when that is not possible.
    fn resolve(&self, run: &mut Run, fact: &RawFact) -> Result<Option<Gene>, IngestError> {
        let resolved = match run.resolved.get(&fact.subject) {
            Some(resolved) => resolved.clone(),
            None => {
                let resolved = match self.normalizer.normalize(&fact.subject) {
                    Ok(gene) => Ok(gene),
                    Err(IngestError::Normalization { reason, .. }) => Err(reason),
                    Err(IngestError::InvalidGeneSymbol(value)) => {
                        Err(format!("invalid gene symbol {value}"))
                    }
                    Err(err) => return Err(err),
                };
                run.resolved.insert(fact.subject.clone(), resolved.clone());
                resolved
            }
        };
        match resolved {
            Ok(gene) => Ok(Some(gene)),
            Err(reason) => {
                warn!(subject = %fact.subject, reason = %reason, "staging fact for review");
                self.repo.stage_for_review(&StagedFact {
                    source: run.source.clone(),
                    fact: fact.clone(),
                    reason,
                    staged_at: Utc::now(),
                })?;
                run.summary.staged += 1;
                Ok(None)
            }
        }
    }

    fn is_known(&self, run: &mut Run, gene: &GeneId, fact: &RawFact) -> Result<bool, IngestError> {
        if !run.known.contains_key(gene) {
            let keys = self
                .repo
                .load_evidence(gene, &run.source)?
                .map(|evidence| evidence.payload.keys())
                .unwrap_or_default();
            run.known.insert(gene.clone(), keys);
        }
        Ok(run
            .known
            .get(gene)
            .is_some_and(|keys| keys.contains(fact.payload.key())))
    }

    /// Merges the buffer into stored evidence and commits it together with
    /// a checkpoint pointing at `cursor`. `items_processed` counts the items
    /// before that cursor.
    fn flush(
        &self,
        run: &mut Run,
        cursor: Option<PageCursor>,
        items_processed: u64,
        status: RunStatus,
    ) -> Result<(), IngestError> {
        run.enter(ProcessorState::Flushing);
        let now = Utc::now();
        let pending = run.buffer.take();
        let mut evidence = Vec::with_capacity(pending.len());
        for (gene_id, (gene, facts)) in pending {
            let existing = self.repo.load_evidence(&gene_id, &run.source)?;
            let (merged, report) =
                merge_evidence(existing.as_ref(), &gene, &run.source, &facts, now)?;
            run.summary.conflicts += report.conflicts.len() as u64;
            run.touched.insert(gene_id);
            evidence.push(merged);
        }

        // Genes must be durable before evidence refers to them.
        self.normalizer.persist()?;

        let mut checkpoint = run.committed.clone();
        checkpoint.cursor = cursor;
        checkpoint.pages_completed = run.pages_completed;
        checkpoint.items_processed = items_processed;
        checkpoint.total_pages = run.total_pages;
        checkpoint.status = status;
        checkpoint.updated_at = now;

        let written = evidence.len();
        self.repo.commit_chunk(&ChunkCommit {
            evidence,
            checkpoint: checkpoint.clone(),
        })?;
        run.committed = checkpoint;
        run.summary.chunks += 1;
        debug!(genes = written, cursor = ?run.committed.cursor, "chunk committed");

        if written > 0 {
            self.invalidate_reads()?;
            if let Some(scoring) = &self.scoring {
                scoring.notify_evidence_changed(&run.source)?;
            }
        }
        Ok(())
    }

    fn finish(&self, run: &mut Run, stop_reason: StopReason) -> Result<RunSummary, IngestError> {
        run.enter(ProcessorState::Draining);
        let status = stop_reason.final_status();
        // Every stop happens on a page boundary, so the buffer holds exactly
        // the facts before `next_cursor`.
        let cursor = run.next_cursor.clone();
        let items = run.items_processed;
        self.flush(run, cursor, items, status)?;

        if let Some(scoring) = &self.scoring {
            scoring.flush_pending(&run.source)?;
        }

        run.enter(ProcessorState::Idle);
        run.summary.stop_reason = stop_reason;
        run.summary.status = status;
        run.summary.genes_touched = run.touched.len();
        info!(
            stop_reason = ?stop_reason,
            pages = run.summary.pages,
            facts = run.summary.facts,
            duplicates = run.summary.duplicates,
            staged = run.summary.staged,
            "run finished"
        );
        self.reporter.publish(run.event(status, None));
        Ok(run.summary.clone())
    }

    /// Leaves the cursor at the last committed chunk and records the error.
    fn fail(&self, run: &mut Run, err: &IngestError) {
        warn!(error = %err, retryable = err.is_retryable(), "run failed");
        let mut checkpoint = run.committed.clone();
        checkpoint.status = RunStatus::Failed;
        checkpoint.last_error = Some(err.to_string());
        checkpoint.updated_at = Utc::now();
        if let Err(save_err) = self.repo.save_checkpoint(&checkpoint) {
            warn!(error = %save_err, "could not record failure in checkpoint");
        }
        run.enter(ProcessorState::Idle);
        let mut event = run.event(RunStatus::Failed, Some(err.to_string()));
        event.current_page = run.committed.pages_completed;
        event.items_processed = run.committed.items_processed;
        self.reporter.publish(event);
    }

    fn invalidate_reads(&self) -> Result<(), IngestError> {
        if let Some(cache) = &self.cache {
            cache.invalidate_namespace(namespace::EVIDENCE)?;
            cache.invalidate_namespace(namespace::SCORES)?;
        }
        Ok(())
    }
}
