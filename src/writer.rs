//! Output Writer - Idempotent, Atomic Artifact Persistence
//!
//! An artifact is either fully visible at its final path or absent. Staleness
//! is tracked with a sidecar fingerprint file so re-runs against unchanged
//! inputs skip both the transform and the write.

use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::assets::ArtifactSpec;
use crate::report::ArtifactError;

/// Namespace subfolder under the output directory for image artifacts.
pub const IMAGE_NAMESPACE: &str = "images";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    UpToDate,
}

/// Persists artifact bytes under `<output>/images/`.
pub struct OutputWriter {
    root: PathBuf,
}

impl OutputWriter {
    /// Creates the output namespace if absent.
    pub fn new(output_dir: &Path) -> Result<Self, std::io::Error> {
        let root = output_dir.join(IMAGE_NAMESPACE);
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Final path of an artifact.
    pub fn artifact_path(&self, spec: &ArtifactSpec) -> PathBuf {
        self.root.join(&spec.identity)
    }

    fn fingerprint_path(&self, spec: &ArtifactSpec) -> PathBuf {
        self.root.join(format!(".{}.fp", spec.identity))
    }

    /// True when a prior artifact exists and its stored fingerprint matches
    /// the current source/rule pair.
    pub fn is_up_to_date(&self, spec: &ArtifactSpec) -> bool {
        if !self.artifact_path(spec).exists() {
            return false;
        }
        let Ok(expected) = spec.fingerprint() else {
            return false;
        };
        match fs::read_to_string(self.fingerprint_path(spec)) {
            Ok(stored) => stored.trim() == expected,
            Err(_) => false,
        }
    }

    /// Write artifact bytes atomically (temp file + rename), then record the
    /// fingerprint. Returns `UpToDate` without touching disk when the
    /// existing artifact already matches.
    pub fn write(&self, spec: &ArtifactSpec, bytes: &[u8]) -> Result<WriteOutcome, ArtifactError> {
        if self.is_up_to_date(spec) {
            return Ok(WriteOutcome::UpToDate);
        }

        let final_path = self.artifact_path(spec);
        // Temp file lives in the same directory so the rename stays on one
        // filesystem and is atomic.
        let temp_path = self
            .root
            .join(format!(".{}.tmp-{}", spec.identity, Uuid::new_v4()));

        fs::write(&temp_path, bytes).map_err(|e| ArtifactError::Io(e.to_string()))?;

        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(ArtifactError::Io(e.to_string()));
        }

        let fingerprint = spec
            .fingerprint()
            .map_err(|e| ArtifactError::Io(e.to_string()))?;
        fs::write(self.fingerprint_path(spec), fingerprint)
            .map_err(|e| ArtifactError::Io(e.to_string()))?;

        tracing::debug!(identity = %spec.identity, "artifact written");
        Ok(WriteOutcome::Written)
    }
}
