pub mod assemble;
pub mod audio;
pub mod config;
pub mod error;
pub mod governor;
pub mod media;
pub mod pipeline;
pub mod resync;
pub mod speech;
pub mod srt;
pub mod stretch;
pub mod temp;
pub mod transcript;
pub mod translate;
pub mod whisper;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use assemble::OutputArtifact;
pub use config::{Config, DubOptions, EncodeOptions};
pub use error::{DubError, DubResult};
pub use media::{Ffmpeg, MediaEngine};
pub use pipeline::{Dubber, ProgressSink, Services};
pub use resync::{choose_fit, Fit, Timeline};
pub use speech::{GoogleSpeech, Synthesizer};
pub use stretch::stretch;
pub use temp::{cleanup_orphaned_temp_files, TempScope};
pub use transcript::{TranscriptSegment, Transcriber};
pub use translate::{LlmTranslator, Translator};
pub use whisper::{WhisperModel, WhisperTranscriber};
pub use worker::{DubJob, JobOutcome, WorkerPool};
