//! Derivation Worker Pool - Bounded, Failure-Isolated Execution
//!
//! Spawns N threads, proxies jobs to them over a channel, and kills the
//! threads when the pool is finished. One job produces exactly one
//! `Finished` event; a failed transform never cancels its siblings.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::assets::ArtifactSpec;
use crate::report::{ArtifactError, ArtifactResult, SkipReason};
use crate::rules::DerivationRule;
use crate::writer::{OutputWriter, WriteOutcome};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::AtomicU32;

#[cfg(feature = "test-hooks")]
static TRANSFORM_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_transform_call_count() -> u32 {
    TRANSFORM_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_transform_call_count() {
    TRANSFORM_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Injected transform-and-encode capability. Implementations wrap a real
/// image codec; the pipeline core never decodes or encodes anything itself.
pub trait Transformer: Send + Sync {
    fn transform(&self, bytes: &[u8], rule: &DerivationRule) -> Result<Vec<u8>, ArtifactError>;
}

/// Passthrough transformer for wiring tests and the CLI. Copies source
/// bytes unchanged regardless of the rule.
pub struct NoopTransformer;

impl Transformer for NoopTransformer {
    fn transform(&self, bytes: &[u8], _rule: &DerivationRule) -> Result<Vec<u8>, ArtifactError> {
        Ok(bytes.to_vec())
    }
}

/// Cooperative cancellation signal shared between the caller and workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One unit of work: a spec plus a shared handle to the source bytes.
pub struct DerivationJob {
    pub seq: usize,
    pub spec: ArtifactSpec,
    pub bytes: Arc<Vec<u8>>,
}

/// Events sent back to the collector. `Started` lets the collector arm the
/// per-artifact timeout from the moment work actually begins, not from
/// enqueue time.
pub enum WorkerEvent {
    Started { seq: usize },
    Finished { seq: usize, spec: ArtifactSpec, result: ArtifactResult },
}

// Thread that takes jobs off the request channel until the finish channel
// is signalled.
struct WorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

fn produce(
    transformer: &Arc<dyn Transformer>,
    writer: &Arc<OutputWriter>,
    job: &DerivationJob,
) -> ArtifactResult {
    #[cfg(feature = "test-hooks")]
    TRANSFORM_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

    let encoded = match transformer.transform(&job.bytes, &job.spec.rule) {
        Ok(bytes) => bytes,
        Err(e) => return ArtifactResult::Failed(e),
    };

    match writer.write(&job.spec, &encoded) {
        Ok(WriteOutcome::Written) => ArtifactResult::Produced,
        Ok(WriteOutcome::UpToDate) => ArtifactResult::Skipped(SkipReason::UpToDate),
        Err(e) => ArtifactResult::Failed(e),
    }
}

impl WorkerThread {
    fn new(
        transformer: Arc<dyn Transformer>,
        writer: Arc<OutputWriter>,
        cancel: CancellationHandle,
        job_rx: Receiver<DerivationJob>,
        event_tx: Sender<WorkerEvent>,
        thread_index: usize,
    ) -> Result<Self, std::io::Error> {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name(format!("derivation-worker-{}", thread_index))
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(job_rx) -> msg => {
                        let Ok(job) = msg else { return };

                        // Dispatched-but-unstarted jobs are dropped on
                        // cancellation; in-flight ones run to completion.
                        if cancel.is_cancelled() {
                            if event_tx.send(WorkerEvent::Finished {
                                seq: job.seq,
                                spec: job.spec,
                                result: ArtifactResult::Cancelled,
                            }).is_err() {
                                return;
                            }
                            continue;
                        }

                        if event_tx.send(WorkerEvent::Started { seq: job.seq }).is_err() {
                            return;
                        }
                        let result = produce(&transformer, &writer, &job);
                        if event_tx.send(WorkerEvent::Finished {
                            seq: job.seq,
                            spec: job.spec,
                            result,
                        }).is_err() {
                            return;
                        }
                    },
                    recv(finish_rx) -> _msg => {
                        return;
                    }
                }
            })?;

        Ok(WorkerThread {
            finish_tx,
            join_handle,
        })
    }
}

/// Bounded pool of derivation workers. Parallelism is capped by the worker
/// count; the job queue itself is unbounded.
pub struct DerivationWorkerPool {
    workers: Vec<WorkerThread>,
    job_tx: Sender<DerivationJob>,
}

impl DerivationWorkerPool {
    pub fn new(
        transformer: Arc<dyn Transformer>,
        writer: Arc<OutputWriter>,
        cancel: CancellationHandle,
        worker_count: usize,
        event_tx: Sender<WorkerEvent>,
    ) -> Result<Self, std::io::Error> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<DerivationJob>();

        let mut workers = Vec::with_capacity(worker_count);
        for thread_index in 0..worker_count {
            workers.push(WorkerThread::new(
                Arc::clone(&transformer),
                Arc::clone(&writer),
                cancel.clone(),
                job_rx.clone(),
                event_tx.clone(),
                thread_index,
            )?);
        }

        Ok(Self { workers, job_tx })
    }

    pub fn submit(&self, job: DerivationJob) {
        // Send only fails when every worker has exited, which only happens
        // after finish(); submissions never race with it.
        let _ = self.job_tx.send(job);
    }

    /// Signal all workers to stop after their current job and join them.
    pub fn finish(self) {
        for worker in &self.workers {
            let _ = worker.finish_tx.send(());
        }
        for worker in self.workers {
            let _ = worker.join_handle.join();
        }
    }

    /// Signal all workers to stop but do not join them. Used when a worker
    /// may still be blocked inside a transform that outlived its budget;
    /// joining would stall the caller until the transform returns. The
    /// thread exits on its own once its event send fails or the finish
    /// signal is seen.
    pub fn detach(self) {
        for worker in &self.workers {
            let _ = worker.finish_tx.send(());
        }
    }
}
