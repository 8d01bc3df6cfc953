use std::path::Path;

use crate::error::DubResult;

/// A span of source speech with its text. Times are seconds from clip start.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Turns a 16 kHz mono WAV into time-ordered segments.
///
/// Implementations are shared by every worker and must tolerate concurrent calls.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &Path) -> DubResult<Vec<TranscriptSegment>>;
}
