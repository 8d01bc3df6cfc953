//! Output size limit.
//!
//! Outputs above the limit get exactly one downscaled re-encode. There is no
//! second pass: a compressed file that is still too large is delivered as is.

use tracing::{info, warn};

use crate::assemble::OutputArtifact;
use crate::config::EncodeOptions;
use crate::error::DubResult;
use crate::media::MediaEngine;
use crate::pipeline::ProgressSink;
use crate::temp::TempScope;

pub struct SizeGovernor<'a> {
    media: &'a dyn MediaEngine,
    limit_bytes: u64,
    options: &'a EncodeOptions,
}

impl<'a> SizeGovernor<'a> {
    pub fn new(media: &'a dyn MediaEngine, limit_bytes: u64, options: &'a EncodeOptions) -> Self {
        Self {
            media,
            limit_bytes,
            options,
        }
    }

    /// Returns `artifact` untouched when it is within the limit. Otherwise
    /// re-encodes once and returns the compressed file, unless that came out
    /// no smaller, in which case the original is kept.
    pub fn ensure_under_limit(
        &self,
        artifact: OutputArtifact,
        scope: &TempScope,
        progress: &dyn ProgressSink,
    ) -> DubResult<OutputArtifact> {
        if artifact.size_bytes <= self.limit_bytes {
            return Ok(artifact);
        }

        progress.report("Compressing large file…");
        info!(
            "Output is {} bytes, limit {}; re-encoding",
            artifact.size_bytes, self.limit_bytes
        );
        let dest = scope.file("_small.mp4");
        self.media.reencode(&artifact.path, &dest, self.options)?;
        let compressed = OutputArtifact::from_path(&dest)?;

        if compressed.size_bytes >= artifact.size_bytes {
            warn!(
                "Re-encode did not shrink the output ({} -> {} bytes); keeping the original",
                artifact.size_bytes, compressed.size_bytes
            );
            scope.release(&dest);
            return Ok(artifact);
        }

        if compressed.size_bytes > self.limit_bytes {
            warn!(
                "Compressed output is still {} bytes, over the {} byte limit",
                compressed.size_bytes, self.limit_bytes
            );
        }
        scope.release(&artifact.path);
        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DubError;
    use crate::testing::{FakeMedia, RecordingProgress};

    fn artifact_of(scope: &TempScope, size: usize) -> OutputArtifact {
        let path = scope.file(".mp4");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        OutputArtifact::from_path(path).unwrap()
    }

    #[test]
    fn small_outputs_pass_through() {
        let media = FakeMedia::new(1.0);
        let options = EncodeOptions::compressed();
        let scope = TempScope::new().unwrap();
        let progress = RecordingProgress::default();
        let original = artifact_of(&scope, 100);

        let result = SizeGovernor::new(&media, 100, &options)
            .ensure_under_limit(original.clone(), &scope, &progress)
            .unwrap();
        assert_eq!(result, original);
        assert_eq!(media.reencodes(), 0);
        assert!(progress.messages().is_empty());
    }

    #[test]
    fn large_outputs_are_compressed_once() {
        let media = FakeMedia::new(1.0).with_reencode_ratio(0.4);
        let options = EncodeOptions::compressed();
        let scope = TempScope::new().unwrap();
        let progress = RecordingProgress::default();
        let original = artifact_of(&scope, 1_000);

        let result = SizeGovernor::new(&media, 500, &options)
            .ensure_under_limit(original.clone(), &scope, &progress)
            .unwrap();
        assert_eq!(result.size_bytes, 400);
        assert_ne!(result.path, original.path);
        assert!(!original.path.exists());
        assert_eq!(media.reencodes(), 1);
        assert_eq!(progress.messages(), vec!["Compressing large file…"]);
    }

    #[test]
    fn still_too_large_is_delivered_anyway() {
        let media = FakeMedia::new(1.0).with_reencode_ratio(0.8);
        let options = EncodeOptions::compressed();
        let scope = TempScope::new().unwrap();
        let original = artifact_of(&scope, 1_000);

        let result = SizeGovernor::new(&media, 500, &options)
            .ensure_under_limit(original, &scope, &RecordingProgress::default())
            .unwrap();
        assert_eq!(result.size_bytes, 800);
        assert_eq!(media.reencodes(), 1);
    }

    #[test]
    fn original_is_kept_when_reencode_grows() {
        let media = FakeMedia::new(1.0).with_reencode_ratio(1.2);
        let options = EncodeOptions::compressed();
        let scope = TempScope::new().unwrap();
        let original = artifact_of(&scope, 1_000);

        let result = SizeGovernor::new(&media, 500, &options)
            .ensure_under_limit(original.clone(), &scope, &RecordingProgress::default())
            .unwrap();
        assert_eq!(result, original);
        assert!(original.path.exists());
        assert_eq!(scope.live_files(), 1);
    }

    #[test]
    fn reencode_failure_propagates() {
        let media = FakeMedia::new(1.0).failing_reencode();
        let options = EncodeOptions::compressed();
        let scope = TempScope::new().unwrap();
        let original = artifact_of(&scope, 1_000);

        let err = SizeGovernor::new(&media, 500, &options)
            .ensure_under_limit(original, &scope, &RecordingProgress::default())
            .unwrap_err();
        assert!(matches!(err, DubError::Media(_)));
    }
}
