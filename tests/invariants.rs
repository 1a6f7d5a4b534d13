//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable pipeline guarantees.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derivepipe_core::{
    ArtifactError, BatchRequest, DerivationRule, NoopTransformer, OutputFormat, Pipeline,
    RuleSet, SourceKind, SourceSkipReason, Transformer,
};

const JPEG_MAGIC: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

fn write_jpeg_fixture(dir: &Path, name: &str) {
    let mut bytes = JPEG_MAGIC.to_vec();
    bytes.extend_from_slice(b"fixture-image-payload");
    fs::write(dir.join(name), bytes).unwrap();
}

fn create_pipeline(transformer: Arc<dyn Transformer>) -> Pipeline {
    Pipeline::new(RuleSet::responsive_defaults(), transformer)
}

struct FailingTransformer {
    fail_width: u32,
    fail_format: OutputFormat,
}

impl Transformer for FailingTransformer {
    fn transform(&self, bytes: &[u8], rule: &DerivationRule) -> Result<Vec<u8>, ArtifactError> {
        if rule.width == self.fail_width && rule.format == self.fail_format {
            Err(ArtifactError::Transform("injected fault".to_string()))
        } else {
            Ok(bytes.to_vec())
        }
    }
}

struct SlowTransformer {
    delay: Duration,
}

impl Transformer for SlowTransformer {
    fn transform(&self, bytes: &[u8], _rule: &DerivationRule) -> Result<Vec<u8>, ArtifactError> {
        std::thread::sleep(self.delay);
        Ok(bytes.to_vec())
    }
}

/// Sleeps only for one width, so a single artifact blows its time budget.
struct StallOn {
    width: u32,
    delay: Duration,
}

impl Transformer for StallOn {
    fn transform(&self, bytes: &[u8], rule: &DerivationRule) -> Result<Vec<u8>, ArtifactError> {
        if rule.width == self.width {
            std::thread::sleep(self.delay);
        }
        Ok(bytes.to_vec())
    }
}

#[test]
fn invariant_concrete_scenario_eight_artifacts() {
    // photo.jpg against the responsive defaults: 4 widths x 2 formats
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let report = pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    assert_eq!(report.produced.len(), 8);
    assert_eq!(report.skipped.len(), 0);
    assert_eq!(report.failed.len(), 0);

    let identities: Vec<_> = report.produced.iter().map(|s| s.identity.as_str()).collect();
    for expected in [
        "photo-320.webp",
        "photo-320.jpg",
        "photo-768.webp",
        "photo-768.jpg",
        "photo-1024.webp",
        "photo-1024.jpg",
        "photo-1920.webp",
        "photo-1920.jpg",
    ] {
        assert!(identities.contains(&expected), "missing {}", expected);
        assert!(output.path().join("images").join(expected).exists());
    }
}

#[test]
fn invariant_report_order_deterministic() {
    let input = tempfile::tempdir().unwrap();
    let output_a = tempfile::tempdir().unwrap();
    let output_b = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");
    write_jpeg_fixture(input.path(), "banner.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let report_a = pipeline
        .run(&BatchRequest::new(input.path(), output_a.path()))
        .unwrap();
    let report_b = pipeline
        .run(&BatchRequest::new(input.path(), output_b.path()))
        .unwrap();

    let ids_a: Vec<_> = report_a.produced.iter().map(|s| &s.identity).collect();
    let ids_b: Vec<_> = report_b.produced.iter().map(|s| &s.identity).collect();
    assert_eq!(ids_a, ids_b);
    assert_eq!(ids_a.len(), 16);
}

#[test]
fn invariant_second_run_is_idempotent() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let request = BatchRequest::new(input.path(), output.path());

    let first = pipeline.run(&request).unwrap();
    assert_eq!(first.produced.len(), 8);

    // Capture modification times; the second run must not rewrite anything.
    let images = output.path().join("images");
    let mtime = |name: &str| fs::metadata(images.join(name)).unwrap().modified().unwrap();
    let before = mtime("photo-320.webp");

    let second = pipeline.run(&request).unwrap();
    assert_eq!(second.produced.len(), 0);
    assert_eq!(second.skipped.len(), 8);
    assert_eq!(second.failed.len(), 0);
    assert_eq!(before, mtime("photo-320.webp"));
}

#[test]
fn invariant_changed_source_invalidates_artifacts() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let request = BatchRequest::new(input.path(), output.path());
    pipeline.run(&request).unwrap();

    // New content under the same name re-derives everything.
    let mut changed = JPEG_MAGIC.to_vec();
    changed.extend_from_slice(b"different-payload");
    fs::write(input.path().join("photo.jpg"), changed).unwrap();

    let report = pipeline.run(&request).unwrap();
    assert_eq!(report.produced.len(), 8);
    assert_eq!(report.skipped.len(), 0);
}

#[test]
fn invariant_failure_is_isolated() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(FailingTransformer {
        fail_width: 320,
        fail_format: OutputFormat::Webp,
    }));
    let report = pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].spec.identity, "photo-320.webp");
    assert!(matches!(report.failed[0].error, ArtifactError::Transform(_)));
    assert_eq!(report.produced.len(), 7);
}

#[test]
fn invariant_failed_artifact_leaves_no_file() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(FailingTransformer {
        fail_width: 320,
        fail_format: OutputFormat::Webp,
    }));
    pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    let images = output.path().join("images");
    // Either absent or complete: the failed artifact is absent, and no
    // partial temp file is visible anywhere in the output.
    assert!(!images.join("photo-320.webp").exists());
    let partials: Vec<_> = fs::read_dir(&images)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(partials.is_empty());
}

#[test]
fn invariant_unmatched_kind_is_nonfatal() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");
    fs::write(input.path().join("icon.svg"), b"<svg xmlns=\"x\"/>").unwrap();

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let report = pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    // icon.svg contributes zero artifact entries but the run still succeeds
    assert_eq!(report.produced.len(), 8);
    assert!(!report.has_failures());
    assert_eq!(report.skipped_sources.len(), 1);
    assert_eq!(report.skipped_sources[0].reason, SourceSkipReason::NoMatchingRules);
}

#[test]
fn invariant_unknown_kind_is_nonfatal() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::write(input.path().join("notes.txt"), b"not an image").unwrap();

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let report = pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    assert_eq!(report.total_artifacts(), 0);
    assert_eq!(report.skipped_sources.len(), 1);
    assert_eq!(
        report.skipped_sources[0].reason,
        SourceSkipReason::UnknownSourceKind
    );
}

#[test]
fn invariant_concurrency_is_bounded_and_parallel() {
    // 20 specs at 50ms each with 4 workers: parallel execution finishes
    // near ceil(20/4) * 50ms, far below the serial 1000ms.
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let mut rules = RuleSet::new();
    for width in (100..2100).step_by(100) {
        rules.register(SourceKind::Jpeg, DerivationRule::new(width, OutputFormat::Webp));
    }

    let pipeline = Pipeline::new(
        rules,
        Arc::new(SlowTransformer {
            delay: Duration::from_millis(50),
        }),
    );
    let mut request = BatchRequest::new(input.path(), output.path());
    request.concurrency = 4;

    let start = Instant::now();
    let report = pipeline.run(&request).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.produced.len(), 20);
    assert!(
        elapsed >= Duration::from_millis(240),
        "finished too fast for 4 workers: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(700),
        "looks serial, not parallel: {:?}",
        elapsed
    );
}

#[test]
fn invariant_timeout_does_not_block_siblings() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(StallOn {
        width: 320,
        delay: Duration::from_millis(500),
    }));
    let mut request = BatchRequest::new(input.path(), output.path());
    request.artifact_timeout = Duration::from_millis(100);
    request.concurrency = 4;

    let report = pipeline.run(&request).unwrap();

    // Both photo-320 artifacts stall past the budget
    assert_eq!(report.failed.len(), 2);
    for failed in &report.failed {
        assert_eq!(failed.error, ArtifactError::Timeout);
        assert!(failed.spec.identity.starts_with("photo-320"));
    }
    assert_eq!(report.produced.len(), 6);
}

#[test]
fn invariant_wedged_worker_does_not_hang_the_run() {
    // One worker, one transform that sleeps far past the budget: the
    // started artifact times out, the queued artifact is starved of a
    // worker slot and times out too, and run() returns promptly instead
    // of blocking behind the wedged thread.
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let mut rules = RuleSet::new();
    rules.register(SourceKind::Jpeg, DerivationRule::new(320, OutputFormat::Webp));
    rules.register(SourceKind::Jpeg, DerivationRule::new(768, OutputFormat::Webp));

    let pipeline = Pipeline::new(
        rules,
        Arc::new(SlowTransformer {
            delay: Duration::from_millis(2000),
        }),
    );
    let mut request = BatchRequest::new(input.path(), output.path());
    request.concurrency = 1;
    request.artifact_timeout = Duration::from_millis(100);

    let start = Instant::now();
    let report = pipeline.run(&request).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.failed.len(), 2);
    for failed in &report.failed {
        assert_eq!(failed.error, ArtifactError::Timeout);
    }
    assert!(
        elapsed < Duration::from_millis(1000),
        "run() blocked behind a wedged worker: {:?}",
        elapsed
    );
}

#[test]
fn invariant_cancellation_records_undispatched() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let request = BatchRequest::new(input.path(), output.path());
    request.cancel.cancel();

    let report = pipeline.run(&request).unwrap();
    assert_eq!(report.cancelled.len(), 8);
    assert_eq!(report.produced.len(), 0);
    assert!(!output.path().join("images").join("photo-320.webp").exists());
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_second_run_performs_zero_transforms() {
    use derivepipe_core::worker::{get_transform_call_count, reset_transform_call_count};

    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_jpeg_fixture(input.path(), "photo.jpg");

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let request = BatchRequest::new(input.path(), output.path());
    pipeline.run(&request).unwrap();

    reset_transform_call_count();
    pipeline.run(&request).unwrap();
    assert_eq!(get_transform_call_count(), 0);
}

#[test]
fn invariant_sniffed_kind_beats_extension() {
    // PNG bytes wearing a .jpg name derive png-ruled artifacts
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(b"png-payload");
    fs::write(input.path().join("shot.jpg"), png).unwrap();

    let pipeline = create_pipeline(Arc::new(NoopTransformer));
    let report = pipeline
        .run(&BatchRequest::new(input.path(), output.path()))
        .unwrap();

    let identities: Vec<_> = report.produced.iter().map(|s| s.identity.as_str()).collect();
    assert!(identities.contains(&"shot-320.png"));
    assert!(!identities.contains(&"shot-320.jpg"));
}
