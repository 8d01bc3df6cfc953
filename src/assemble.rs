//! Joins fitted clip pairs into the dubbed video.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::audio::{self, Waveform};
use crate::config::EncodeOptions;
use crate::error::{DubError, DubResult};
use crate::media::{MediaEngine, RenderPlan, VideoClip};
use crate::resync::Timeline;
use crate::temp::TempScope;

/// A rendered video file and its size on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl OutputArtifact {
    pub fn from_path(path: impl Into<PathBuf>) -> DubResult<Self> {
        let path = path.into();
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self { path, size_bytes })
    }
}

pub struct Assembler<'a> {
    media: &'a dyn MediaEngine,
    encode: &'a EncodeOptions,
}

impl<'a> Assembler<'a> {
    pub fn new(media: &'a dyn MediaEngine, encode: &'a EncodeOptions) -> Self {
        Self { media, encode }
    }

    pub fn assemble(
        &self,
        timeline: Timeline,
        source: &Path,
        scope: &TempScope,
    ) -> DubResult<OutputArtifact> {
        let (video, audio) = timeline.into_tracks();
        self.assemble_tracks(video, &audio, source, scope)
    }

    /// Concatenate both tracks in order and render them over the source
    /// video. The two tracks must pair up one to one.
    pub fn assemble_tracks(
        &self,
        video: Vec<VideoClip>,
        audio: &[Waveform],
        source: &Path,
        scope: &TempScope,
    ) -> DubResult<OutputArtifact> {
        if video.len() != audio.len() {
            error!(
                "Track mismatch for {}: {} video clips, {} audio clips",
                source.display(),
                video.len(),
                audio.len()
            );
            return Err(DubError::Assembly(format!(
                "{} video clips but {} audio clips",
                video.len(),
                audio.len()
            )));
        }
        if video.is_empty() {
            return Err(DubError::Assembly(format!(
                "no speech segments to dub in {}",
                source.display()
            )));
        }

        let track = audio::concatenate(audio)?;
        let track_path = scope.file(".wav");
        audio::write_wav(&track_path, &track)?;

        let frame_rate = self.media.probe_frame_rate(source)?;
        let plan = RenderPlan {
            source: source.to_path_buf(),
            frame_rate,
            clips: video,
            audio: track_path.clone(),
            encode: self.encode.clone(),
        };
        let dest = scope.file("_dub.mp4");
        let rendered = self.media.render(&plan, &dest);
        scope.release(&track_path);
        rendered?;

        let artifact = OutputArtifact::from_path(dest)?;
        info!(
            "Rendered {} clips ({:.2}s of audio, {} bytes)",
            plan.clips.len(),
            track.duration_secs(),
            artifact.size_bytes
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tone, FakeMedia, TEST_SAMPLE_RATE};

    #[test]
    fn mismatched_tracks_are_rejected() {
        let media = FakeMedia::new(10.0);
        let encode = EncodeOptions::final_output();
        let scope = TempScope::new().unwrap();
        let video = vec![VideoClip::subclip(0.0, 1.0), VideoClip::subclip(1.0, 2.0)];
        let audio = vec![tone(1.0, TEST_SAMPLE_RATE)];

        let err = Assembler::new(&media, &encode)
            .assemble_tracks(video, &audio, Path::new("in.mp4"), &scope)
            .unwrap_err();
        assert!(matches!(err, DubError::Assembly(_)));
        assert!(media.renders().is_empty());
    }

    #[test]
    fn empty_timeline_is_rejected() {
        let media = FakeMedia::new(10.0);
        let encode = EncodeOptions::final_output();
        let scope = TempScope::new().unwrap();
        let err = Assembler::new(&media, &encode)
            .assemble(Timeline::new(), Path::new("in.mp4"), &scope)
            .unwrap_err();
        assert!(matches!(err, DubError::Assembly(_)));
    }

    #[test]
    fn renders_clips_in_order_and_frees_the_track() {
        let media = FakeMedia::new(10.0).with_bytes_per_clip(500);
        let encode = EncodeOptions::final_output();
        let scope = TempScope::new().unwrap();
        let video = vec![
            VideoClip::subclip(0.0, 1.0),
            VideoClip::subclip(3.0, 4.0).with_speed(0.5),
            VideoClip::subclip(1.0, 2.0),
        ];
        let audio = vec![
            tone(1.0, TEST_SAMPLE_RATE),
            tone(2.0, TEST_SAMPLE_RATE),
            tone(1.0, TEST_SAMPLE_RATE),
        ];

        let artifact = Assembler::new(&media, &encode)
            .assemble_tracks(video.clone(), &audio, Path::new("in.mp4"), &scope)
            .unwrap();

        assert_eq!(artifact.size_bytes, 1_500);
        assert!(artifact.path.starts_with(scope.path()));
        let renders = media.renders();
        assert_eq!(renders.len(), 1);
        assert_eq!(renders[0].clips, video);
        assert_eq!(renders[0].source, PathBuf::from("in.mp4"));
        assert!(!renders[0].audio.exists());
        // only the rendered video is left
        assert_eq!(scope.live_files(), 1);
    }

    #[test]
    fn mixed_sample_rates_fail_assembly() {
        let media = FakeMedia::new(10.0);
        let encode = EncodeOptions::final_output();
        let scope = TempScope::new().unwrap();
        let video = vec![VideoClip::subclip(0.0, 1.0), VideoClip::subclip(1.0, 2.0)];
        let audio = vec![tone(1.0, 8_000), tone(1.0, 16_000)];
        let err = Assembler::new(&media, &encode)
            .assemble_tracks(video, &audio, Path::new("in.mp4"), &scope)
            .unwrap_err();
        assert!(matches!(err, DubError::Assembly(_)));
    }
}
