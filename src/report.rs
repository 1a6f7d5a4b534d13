//! Batch Reporting - One Result Per Artifact
//!
//! Every dispatched derivation yields exactly one ArtifactResult; nothing is
//! silently dropped. The report is the sole return value of a pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::assets::ArtifactSpec;

/// Per-artifact failure. Never fatal to the batch.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactError {
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Derivation exceeded its time budget")]
    Timeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Existing artifact fingerprint matches the current source and rule.
    UpToDate,
}

/// Why a whole source contributed no artifacts to the batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceSkipReason {
    UnknownSourceKind,
    NoMatchingRules,
    Unreadable,
}

/// Outcome of attempting to produce one ArtifactSpec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactResult {
    Produced,
    Skipped(SkipReason),
    Failed(ArtifactError),
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedArtifact {
    pub spec: ArtifactSpec,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedArtifact {
    pub spec: ArtifactSpec,
    pub error: ArtifactError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: SourceSkipReason,
}

/// Aggregated outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub produced: Vec<ArtifactSpec>,
    pub skipped: Vec<SkippedArtifact>,
    pub failed: Vec<FailedArtifact>,
    pub cancelled: Vec<ArtifactSpec>,
    pub skipped_sources: Vec<SkippedSource>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            produced: vec![],
            skipped: vec![],
            failed: vec![],
            cancelled: vec![],
            skipped_sources: vec![],
        }
    }

    /// Append-only insertion of one result. Results may arrive in any
    /// completion order; `finalize` restores a deterministic ordering.
    pub fn record(&mut self, spec: ArtifactSpec, result: ArtifactResult) {
        match result {
            ArtifactResult::Produced => self.produced.push(spec),
            ArtifactResult::Skipped(reason) => self.skipped.push(SkippedArtifact { spec, reason }),
            ArtifactResult::Failed(error) => self.failed.push(FailedArtifact { spec, error }),
            ArtifactResult::Cancelled => self.cancelled.push(spec),
        }
    }

    pub fn record_skipped_source(&mut self, path: PathBuf, reason: SourceSkipReason) {
        self.skipped_sources.push(SkippedSource { path, reason });
    }

    /// Sort every section by artifact identity and stamp the finish time,
    /// making the report independent of completion order.
    pub fn finalize(&mut self) {
        self.produced.sort_by(|a, b| a.identity.cmp(&b.identity));
        self.skipped
            .sort_by(|a, b| a.spec.identity.cmp(&b.spec.identity));
        self.failed
            .sort_by(|a, b| a.spec.identity.cmp(&b.spec.identity));
        self.cancelled.sort_by(|a, b| a.identity.cmp(&b.identity));
        self.skipped_sources.sort_by(|a, b| a.path.cmp(&b.path));
        self.finished_at = Some(Utc::now());
    }

    pub fn total_artifacts(&self) -> usize {
        self.produced.len() + self.skipped.len() + self.failed.len() + self.cancelled.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        format!(
            "{} produced, {} skipped, {} failed, {} cancelled",
            self.produced.len(),
            self.skipped.len(),
            self.failed.len(),
            self.cancelled.len()
        )
    }
}

impl Default for BatchReport {
    fn default() -> Self {
        Self::new()
    }
}
