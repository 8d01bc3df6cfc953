//! One video in, one dubbed video out.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::assemble::{Assembler, OutputArtifact};
use crate::config::DubOptions;
use crate::error::DubResult;
use crate::governor::SizeGovernor;
use crate::media::MediaEngine;
use crate::resync::Resynchronizer;
use crate::speech::Synthesizer;
use crate::srt::Subtitle;
use crate::temp::TempScope;
use crate::transcript::Transcriber;
use crate::translate::Translator;

/// Receives human-readable status lines while a job runs.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

/// The external collaborators, shared read-only by every job.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub media: Arc<dyn MediaEngine>,
}

#[derive(Debug)]
pub struct DubbedVideo {
    /// Lives inside the caller's scope until persisted.
    pub artifact: OutputArtifact,
    pub subtitles: Subtitle,
    /// Transcript segments that made it into the output.
    pub segments: usize,
}

pub struct Dubber {
    services: Services,
    options: DubOptions,
}

impl Dubber {
    pub fn new(services: Services, options: DubOptions) -> Self {
        Self { services, options }
    }

    pub fn governor(&self, limit_bytes: u64) -> SizeGovernor<'_> {
        SizeGovernor::new(self.services.media.as_ref(), limit_bytes, &self.options.compress)
    }

    /// Run the whole pipeline on `source`. Every intermediate file is created
    /// in `scope`, including the returned artifact.
    pub fn dub(
        &self,
        source: &Path,
        scope: &TempScope,
        progress: &dyn ProgressSink,
    ) -> DubResult<DubbedVideo> {
        let media = self.services.media.as_ref();

        let duration = media.probe_duration(source)?;
        progress.report(&format!("Duration: {:.2}s", duration));

        let speech = scope.file(".wav");
        let segments = media
            .extract_audio(source, &speech)
            .and_then(|()| self.services.transcriber.transcribe(&speech));
        scope.release(&speech);
        let segments = segments?;
        info!(
            "Transcribed {} segments from {}",
            segments.len(),
            source.display()
        );

        let timeline = Resynchronizer::new(
            self.services.translator.as_ref(),
            self.services.synthesizer.as_ref(),
            media,
            &self.options,
        )
        .run(&segments, duration, scope, progress)?;

        if timeline.is_empty() {
            progress.report("No usable speech found");
        }
        let subtitles = timeline.subtitles();
        let used = timeline.len();
        let artifact = Assembler::new(media, &self.options.encode).assemble(timeline, source, scope)?;

        Ok(DubbedVideo {
            artifact,
            subtitles,
            segments: used,
        })
    }
}
