//! Pipeline Orchestrator - Single Entry Point
//!
//! Drives Discovering -> Expanding -> Deriving -> Done. Per-artifact
//! failures are recorded and never abort the batch; only discovery-level
//! failures are fatal.

use crossbeam_channel::RecvTimeoutError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::assets::{expand, ArtifactSpec, SourceAsset};
use crate::report::{ArtifactError, ArtifactResult, BatchReport, SkipReason, SourceSkipReason};
use crate::rules::{RuleSet, SourceKind};
use crate::worker::{
    CancellationHandle, DerivationJob, DerivationWorkerPool, Transformer, WorkerEvent,
};
use crate::writer::OutputWriter;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Source directory not found: {0}")]
    SourceDirNotFound(PathBuf),

    #[error("Invalid rule set: {0}")]
    InvalidRuleSet(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Batch phases, logged as the orchestrator advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Discovering,
    Expanding,
    Deriving,
    Done,
}

/// Parameters of one pipeline run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Worker thread count; 0 means available parallelism.
    pub concurrency: usize,
    /// Budget for one transform-and-write, measured from the moment a
    /// worker starts the artifact. A queued artifact that cannot get a
    /// worker slot for a further full budget is timed out as starved.
    pub artifact_timeout: Duration,
    pub cancel: CancellationHandle,
}

impl BatchRequest {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            concurrency: 0,
            artifact_timeout: Duration::from_secs(30),
            cancel: CancellationHandle::new(),
        }
    }
}

/// The derivation pipeline - single entry point for batch runs.
pub struct Pipeline {
    rules: RuleSet,
    transformer: Arc<dyn Transformer>,
}

impl Pipeline {
    pub fn new(rules: RuleSet, transformer: Arc<dyn Transformer>) -> Self {
        Self { rules, transformer }
    }

    /// Construct with a rule set loaded from a JSON file.
    pub fn with_rules_file(
        path: &Path,
        transformer: Arc<dyn Transformer>,
    ) -> Result<Self, PipelineError> {
        let rules = RuleSet::load_from_file(path)
            .map_err(|e| PipelineError::InvalidRuleSet(e.to_string()))?;
        Ok(Self::new(rules, transformer))
    }

    /// Run one batch. Returns the report; `Err` only for discovery-level
    /// failures (missing source directory, unreadable output directory).
    pub fn run(&self, request: &BatchRequest) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport::new();

        tracing::info!(phase = ?BatchPhase::Discovering, dir = %request.input_dir.display(), "batch started");
        let sources = self.discover(&request.input_dir, &mut report)?;

        tracing::info!(phase = ?BatchPhase::Expanding, sources = sources.len(), "expanding variants");
        let pending = self.expand_all(&sources, &mut report);

        tracing::info!(phase = ?BatchPhase::Deriving, artifacts = pending.len(), "deriving artifacts");
        let writer = Arc::new(OutputWriter::new(&request.output_dir)?);
        self.derive_all(pending, &writer, request, &mut report)?;

        report.finalize();
        tracing::info!(phase = ?BatchPhase::Done, summary = %report.summary(), "batch finished");
        Ok(report)
    }

    /// Shallow enumeration of the source directory. A missing directory is
    /// fatal; an unreadable individual file is a per-source skip.
    fn discover(
        &self,
        input_dir: &Path,
        report: &mut BatchReport,
    ) -> Result<Vec<SourceAsset>, PipelineError> {
        if !input_dir.is_dir() {
            return Err(PipelineError::SourceDirNotFound(input_dir.to_path_buf()));
        }

        let mut sources = vec![];
        for entry in fs::read_dir(input_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match SourceAsset::load(&path) {
                Ok(asset) => sources.push(asset),
                Err(e) => {
                    tracing::warn!(source = %path.display(), error = %e, "source unreadable, skipping");
                    report.record_skipped_source(path, SourceSkipReason::Unreadable);
                }
            }
        }
        sources.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(sources)
    }

    /// Expand every source and merge into one global work queue keyed by
    /// output identity, deduplicating cross-source collisions too.
    fn expand_all(
        &self,
        sources: &[SourceAsset],
        report: &mut BatchReport,
    ) -> BTreeMap<String, (ArtifactSpec, Arc<Vec<u8>>)> {
        let mut pending = BTreeMap::new();

        for source in sources {
            if source.kind == SourceKind::Unknown {
                tracing::warn!(source = %source.path.display(), "unknown source kind, skipping");
                report.record_skipped_source(source.path.clone(), SourceSkipReason::UnknownSourceKind);
                continue;
            }

            let specs = expand(source, &self.rules);
            if specs.is_empty() {
                tracing::warn!(
                    source = %source.path.display(),
                    kind = source.kind.as_str(),
                    "no rules for source kind, skipping"
                );
                report.record_skipped_source(source.path.clone(), SourceSkipReason::NoMatchingRules);
                continue;
            }

            for spec in specs {
                let identity = spec.identity.clone();
                if pending.insert(identity.clone(), (spec, source.bytes())).is_some() {
                    tracing::warn!(
                        identity = %identity,
                        source = %source.path.display(),
                        "cross-source identity collision, last source wins"
                    );
                }
            }
        }

        pending
    }

    fn derive_all(
        &self,
        pending: BTreeMap<String, (ArtifactSpec, Arc<Vec<u8>>)>,
        writer: &Arc<OutputWriter>,
        request: &BatchRequest,
        report: &mut BatchReport,
    ) -> Result<(), PipelineError> {
        // Up-to-date artifacts are resolved before dispatch so a clean
        // re-run performs zero transforms.
        let mut to_dispatch = vec![];
        for (_, (spec, bytes)) in pending {
            if writer.is_up_to_date(&spec) {
                report.record(spec, ArtifactResult::Skipped(SkipReason::UpToDate));
            } else if request.cancel.is_cancelled() {
                report.record(spec, ArtifactResult::Cancelled);
            } else {
                to_dispatch.push((spec, bytes));
            }
        }

        if to_dispatch.is_empty() {
            return Ok(());
        }

        let worker_count = resolve_concurrency(request.concurrency).min(to_dispatch.len());
        let specs_by_seq: Vec<ArtifactSpec> =
            to_dispatch.iter().map(|(spec, _)| spec.clone()).collect();

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let pool = DerivationWorkerPool::new(
            Arc::clone(&self.transformer),
            Arc::clone(writer),
            request.cancel.clone(),
            worker_count,
            event_tx,
        )?;

        for (seq, (spec, bytes)) in to_dispatch.into_iter().enumerate() {
            pool.submit(DerivationJob { seq, spec, bytes });
        }

        let timed_out = collect_results(
            specs_by_seq,
            &event_rx,
            request.artifact_timeout,
            report,
        );
        // A timed-out worker is still blocked inside its transform; joining
        // it would stall the run for as long as the transform takes.
        if timed_out > 0 {
            pool.detach();
        } else {
            pool.finish();
        }
        Ok(())
    }
}

fn resolve_concurrency(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Collect exactly one result per dispatched spec and return how many
/// timed out. Timeouts are enforced here: a spec whose result does not
/// arrive within its budget (measured from its Started event) is recorded
/// Failed(Timeout) and its late result, if any, is drained and discarded.
/// When nothing is in flight but specs are still queued, a fallback
/// deadline of one budget is armed for them; if it expires the queued
/// specs are starved (every worker is wedged past its budget) and are
/// timed out as well, so this loop always terminates.
fn collect_results(
    specs_by_seq: Vec<ArtifactSpec>,
    event_rx: &crossbeam_channel::Receiver<WorkerEvent>,
    timeout: Duration,
    report: &mut BatchReport,
) -> usize {
    let total = specs_by_seq.len();
    // Every seq is in exactly one state: queued, in_flight, or resolved.
    // timed_out holds resolved seqs whose late events still need draining.
    let mut queued: HashSet<usize> = (0..total).collect();
    let mut in_flight: HashMap<usize, Instant> = HashMap::new();
    let mut timed_out: HashSet<usize> = HashSet::new();
    let mut resolved = 0usize;
    let mut timeout_count = 0usize;

    while resolved < total {
        let deadline = in_flight
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| Instant::now() + timeout);

        match event_rx.recv_deadline(deadline) {
            Ok(WorkerEvent::Started { seq }) => {
                // A starved seq may still start once a wedged worker wakes;
                // it is already resolved, so leave no deadline behind.
                if queued.remove(&seq) {
                    in_flight.insert(seq, Instant::now() + timeout);
                }
            }
            Ok(WorkerEvent::Finished { seq, spec, result }) => {
                in_flight.remove(&seq);
                if timed_out.remove(&seq) {
                    // Already reported as timed out; drop the late result.
                    tracing::debug!(identity = %spec.identity, "late result after timeout, discarded");
                    continue;
                }
                // Cancelled jobs finish without a Started event.
                queued.remove(&seq);
                report.record(spec, result);
                resolved += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let overdue: Vec<usize> = in_flight
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in overdue {
                    in_flight.remove(&seq);
                    timed_out.insert(seq);
                    let spec = specs_by_seq[seq].clone();
                    tracing::warn!(identity = %spec.identity, "derivation timed out");
                    report.record(spec, ArtifactResult::Failed(ArtifactError::Timeout));
                    resolved += 1;
                    timeout_count += 1;
                }

                // Fallback deadline expired with nothing in flight: no
                // worker slot freed up within a full budget, so the queued
                // specs can never start. Time them out rather than block.
                if in_flight.is_empty() {
                    let starved: Vec<usize> = queued.drain().collect();
                    for seq in starved {
                        timed_out.insert(seq);
                        let spec = specs_by_seq[seq].clone();
                        tracing::warn!(identity = %spec.identity, "derivation starved of a worker slot, timed out");
                        report.record(spec, ArtifactResult::Failed(ArtifactError::Timeout));
                        resolved += 1;
                        timeout_count += 1;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    timeout_count
}
