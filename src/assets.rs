//! Source Assets and Variant Expansion
//!
//! A SourceAsset is read once and never mutated; every derived artifact is
//! described up front as an ArtifactSpec before any work is dispatched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hashing::{artifact_fingerprint, rule_fingerprint, sha256_hex};
use crate::rules::{DerivationRule, RuleSet, SourceKind};

/// One input file, read fully into memory and shared read-only across workers.
#[derive(Debug, Clone)]
pub struct SourceAsset {
    pub path: PathBuf,
    pub base_name: String,
    pub kind: SourceKind,
    pub content_hash: String,
    bytes: Arc<Vec<u8>>,
}

impl SourceAsset {
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let bytes = fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        // Base name is everything before the first dot, so "photo.jpg" and
        // "photo.orig.jpg" both derive "photo-*" siblings.
        let base_name = file_name
            .split('.')
            .next()
            .unwrap_or(&file_name)
            .to_string();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let kind = classify(&bytes, &extension);
        let content_hash = sha256_hex(&bytes);

        Ok(Self {
            path: path.to_path_buf(),
            base_name,
            kind,
            content_hash,
            bytes: Arc::new(bytes),
        })
    }

    /// Shared handle to the raw bytes; cloning is a refcount bump.
    pub fn bytes(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.bytes)
    }
}

/// Classify a source by content magic bytes, falling back to the declared
/// extension when the content is unrecognized.
pub fn classify(bytes: &[u8], extension: &str) -> SourceKind {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return SourceKind::Jpeg;
    }
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return SourceKind::Png;
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return SourceKind::Gif;
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return SourceKind::Webp;
    }
    let head = &bytes[..bytes.len().min(256)];
    if let Ok(text) = std::str::from_utf8(head) {
        let trimmed = text.trim_start();
        if trimmed.starts_with("<svg") || trimmed.starts_with("<?xml") {
            return SourceKind::Svg;
        }
    }

    match extension {
        "jpg" | "jpeg" => SourceKind::Jpeg,
        "png" => SourceKind::Png,
        "gif" => SourceKind::Gif,
        "webp" => SourceKind::Webp,
        "svg" => SourceKind::Svg,
        _ => SourceKind::Unknown,
    }
}

/// Fully resolved identity + parameters of one output artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    /// Deterministic output identity, e.g. `photo-320.webp`.
    pub identity: String,
    pub source_path: PathBuf,
    pub source_kind: SourceKind,
    pub source_hash: String,
    pub rule: DerivationRule,
}

impl ArtifactSpec {
    pub fn new(source: &SourceAsset, rule: DerivationRule) -> Self {
        let identity = format!(
            "{}-{}.{}",
            source.base_name,
            rule.suffix(),
            rule.format.extension()
        );
        Self {
            identity,
            source_path: source.path.clone(),
            source_kind: source.kind,
            source_hash: source.content_hash.clone(),
            rule,
        }
    }

    /// Fingerprint stored next to the artifact to detect staleness.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let rule_fp = rule_fingerprint(&self.rule)?;
        Ok(artifact_fingerprint(&self.source_hash, &rule_fp))
    }
}

/// Expand one source against the rule set into the specs to produce.
///
/// Colliding output identities are deduplicated last-rule-wins and logged;
/// the result is sorted by identity so expansion is order-independent.
/// A kind with no registered rules expands to an empty vec, not an error.
pub fn expand(source: &SourceAsset, rules: &RuleSet) -> Vec<ArtifactSpec> {
    let Some(applicable) = rules.rules_for(source.kind) else {
        return vec![];
    };

    let mut by_identity: BTreeMap<String, ArtifactSpec> = BTreeMap::new();
    for rule in applicable {
        let spec = ArtifactSpec::new(source, rule.clone());
        if let Some(previous) = by_identity.insert(spec.identity.clone(), spec) {
            tracing::warn!(
                identity = %previous.identity,
                source = %source.path.display(),
                "output identity collision, last rule wins"
            );
        }
    }

    by_identity.into_values().collect()
}
