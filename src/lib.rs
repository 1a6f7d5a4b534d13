//! DerivePipe Core - Derived-Asset Pipeline
//!
//! # The Pipeline Guarantees (Non-Negotiable)
//! 1. Sources Are Immutable
//! 2. Expansion Is Deterministic
//! 3. Failures Are Isolated
//! 4. Writes Are Atomic
//! 5. Re-Runs Are Idempotent
//! 6. Every Artifact Gets Exactly One Result

pub mod assets;
pub mod hashing;
pub mod pipeline;
pub mod report;
pub mod rules;
pub mod worker;
pub mod writer;

pub use assets::{classify, expand, ArtifactSpec, SourceAsset};
pub use hashing::{artifact_fingerprint, canonical_json, rule_fingerprint, sha256_hex};
pub use pipeline::{BatchPhase, BatchRequest, Pipeline, PipelineError};
pub use report::{ArtifactError, ArtifactResult, BatchReport, SkipReason, SourceSkipReason};
pub use rules::{DerivationRule, OutputFormat, RuleSet, SourceKind};
pub use worker::{CancellationHandle, NoopTransformer, Transformer};
pub use writer::{OutputWriter, WriteOutcome};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
