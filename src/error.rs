use thiserror::Error;

pub type DubResult<T> = Result<T, DubError>;

#[derive(Debug, Error)]
pub enum DubError {
    #[error("invalid stretch rate {rate}: must be greater than zero")]
    InvalidRate { rate: f64 },

    #[error("cannot stretch empty audio")]
    EmptyAudio,

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    /// Video and audio tracks disagree. Always a pairing bug, never user input.
    #[error("timeline assembly failed: {0}")]
    Assembly(String),

    #[error("media processing failed: {0}")]
    Media(String),

    #[error("ffmpeg failure: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("wav failure: {0}")]
    Wav(#[from] hound::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl DubError {
    #[must_use]
    pub fn from_process_failure(program: &str, status: Option<i32>, stderr: &[u8]) -> Self {
        let stderr = String::from_utf8_lossy(stderr);
        let trimmed = stderr.trim();
        let status = status.map_or_else(|| "signal".to_owned(), |code| code.to_string());
        if trimmed.is_empty() {
            Self::Media(format!("`{program}` exited with status {status}"))
        } else {
            Self::Media(format!("`{program}` exited with status {status}; stderr: {trimmed}"))
        }
    }

    /// External-service failures abort the request; everything else is a local fault.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::Transcription(_) | Self::Translation(_) | Self::Synthesis(_)
        )
    }
}
