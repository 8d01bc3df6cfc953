//! Segment resynchronization.
//!
//! Each transcript segment owns a fixed window of the source video. Its dubbed
//! speech is first sped up by the baseline factor, then fitted to the window:
//!
//! * speech at most as long as the window is slowed back down until it fills
//!   the window exactly, and the video window is used as recorded;
//! * longer speech is kept as is and the video window is retimed by
//!   `window / speech` so the picture lasts as long as the speech.
//!
//! The retimed video length is computed, not re-measured, so a clip pair of the
//! second kind may differ from its audio by a few milliseconds.

use tracing::{debug, info};

use crate::audio::Waveform;
use crate::config::DubOptions;
use crate::error::DubResult;
use crate::media::{MediaEngine, VideoClip};
use crate::pipeline::ProgressSink;
use crate::speech::Synthesizer;
use crate::srt::Subtitle;
use crate::stretch::stretch;
use crate::temp::TempScope;
use crate::transcript::TranscriptSegment;
use crate::translate::Translator;

/// How a segment's audio and video are made to agree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fit {
    /// Slow the audio by `rate` (`<= 1`) so it fills the window.
    StretchAudio { rate: f64 },
    /// Keep the audio and slow the video window down. `speed` (`< 1`) is a
    /// playback-speed factor, not a duration ratio: the retimed clip lasts
    /// `window / speed`, which is the sped-up speech length.
    RetimeVideo { speed: f64 },
}

/// Pick the fit for sped-up speech of `speech_secs` in a `window_secs` window.
pub fn choose_fit(speech_secs: f64, window_secs: f64) -> Fit {
    if speech_secs <= window_secs {
        Fit::StretchAudio {
            rate: speech_secs / window_secs,
        }
    } else {
        Fit::RetimeVideo {
            speed: window_secs / speech_secs,
        }
    }
}

/// The clamped window of a segment within a clip of `clip_duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// The segment starts at or past the clip end; so does everything after it.
    PastEnd,
    /// Nothing left after clamping.
    Empty,
    Span { start: f64, end: f64 },
}

pub fn clamp_window(segment: &TranscriptSegment, clip_duration: f64) -> Window {
    if segment.start >= clip_duration {
        return Window::PastEnd;
    }
    let end = segment.end.min(clip_duration);
    if end - segment.start <= 0.0 {
        return Window::Empty;
    }
    Window::Span {
        start: segment.start,
        end,
    }
}

/// One segment's dubbed audio and the video it plays over.
#[derive(Debug, Clone)]
pub struct TimedClipPair {
    /// Position of the segment in the transcript.
    pub index: usize,
    pub video: VideoClip,
    pub audio: Waveform,
    /// Translated text that was spoken.
    pub text: String,
    pub fit: Fit,
}

impl TimedClipPair {
    pub fn duration(&self) -> f64 {
        self.video.duration()
    }
}

/// Clip pairs in transcript order.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pairs: Vec<TimedClipPair>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pair: TimedClipPair) {
        self.pairs.push(pair);
    }

    pub fn pairs(&self) -> &[TimedClipPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Total video length.
    pub fn duration(&self) -> f64 {
        self.pairs.iter().map(TimedClipPair::duration).sum()
    }

    /// Translated text timed against the assembled output.
    pub fn subtitles(&self) -> Subtitle {
        let mut subtitle = Subtitle::new();
        let mut cursor = 0.0;
        for pair in &self.pairs {
            let end = cursor + pair.duration();
            subtitle.push(cursor, end, pair.text.clone());
            cursor = end;
        }
        subtitle
    }

    /// Split into the video and audio tracks, order preserved.
    pub fn into_tracks(self) -> (Vec<VideoClip>, Vec<Waveform>) {
        self.pairs.into_iter().map(|p| (p.video, p.audio)).unzip()
    }
}

/// Turns transcript segments into fitted clip pairs.
pub struct Resynchronizer<'a> {
    translator: &'a dyn Translator,
    synthesizer: &'a dyn Synthesizer,
    media: &'a dyn MediaEngine,
    options: &'a DubOptions,
}

impl<'a> Resynchronizer<'a> {
    pub fn new(
        translator: &'a dyn Translator,
        synthesizer: &'a dyn Synthesizer,
        media: &'a dyn MediaEngine,
        options: &'a DubOptions,
    ) -> Self {
        Self {
            translator,
            synthesizer,
            media,
            options,
        }
    }

    /// Fit every usable segment, strictly in order. Segments that start past
    /// the clip end stop the run; segments empty after clamping are skipped.
    pub fn run(
        &self,
        segments: &[TranscriptSegment],
        clip_duration: f64,
        scope: &TempScope,
        progress: &dyn ProgressSink,
    ) -> DubResult<Timeline> {
        let mut timeline = Timeline::new();
        for (index, segment) in segments.iter().enumerate() {
            let (start, end) = match clamp_window(segment, clip_duration) {
                Window::PastEnd => {
                    debug!(
                        "Segment {} starts at {:.2}s, past clip end {:.2}s; stopping",
                        index, segment.start, clip_duration
                    );
                    break;
                }
                Window::Empty => {
                    debug!("Segment {} is empty after clamping; skipped", index);
                    continue;
                }
                Window::Span { start, end } => (start, end),
            };

            let pair = self.fit_segment(index, start, end, &segment.text, scope, progress)?;
            timeline.push(pair);
        }

        info!(
            "Resynchronized {} of {} segments ({:.2}s of video)",
            timeline.len(),
            segments.len(),
            timeline.duration()
        );
        Ok(timeline)
    }

    fn fit_segment(
        &self,
        index: usize,
        start: f64,
        end: f64,
        text: &str,
        scope: &TempScope,
        progress: &dyn ProgressSink,
    ) -> DubResult<TimedClipPair> {
        let window = end - start;
        let source_text = text.trim();
        progress.report(&format!(
            "Seg {}: {:.2}-{:.2}s\nEN: {}",
            index, start, end, source_text
        ));

        let translated = self
            .translator
            .translate(
                source_text,
                &self.options.source_language,
                &self.options.target_language,
            )?
            .trim()
            .to_string();
        progress.report(&format!("HI: {}", translated));

        let speech = self.synthesize(&translated, scope)?;
        let (fast, fast_len) = stretch(&speech, self.options.baseline_speedup)?;
        drop(speech);
        progress.report(&format!(
            "Audio @{:.2}x: {:.2}s",
            self.options.baseline_speedup, fast_len
        ));

        let fit = choose_fit(fast_len, window);
        let video = VideoClip::subclip(start, end);
        let (video, audio) = match fit {
            Fit::StretchAudio { rate } => {
                let (fitted, realized) = stretch(&fast, rate)?;
                debug!(
                    "Segment {}: audio {:.3}s -> {:.3}s (rate {:.3}), window {:.3}s",
                    index, fast_len, realized, rate, window
                );
                (video, fitted)
            }
            Fit::RetimeVideo { speed } => {
                debug!(
                    "Segment {}: audio {:.3}s overruns window {:.3}s; video speed {:.3}",
                    index, fast_len, window, speed
                );
                (video.with_speed(speed), fast)
            }
        };

        Ok(TimedClipPair {
            index,
            video,
            audio,
            text: translated,
            fit,
        })
    }

    /// Synthesize to a scoped file, decode it and delete the file straight away.
    fn synthesize(&self, text: &str, scope: &TempScope) -> DubResult<Waveform> {
        let path = scope.file(self.synthesizer.file_suffix());
        let result = self
            .synthesizer
            .synthesize(text, &self.options.target_language, &path)
            .and_then(|()| self.media.load_waveform(&path, self.options.sample_rate));
        scope.release(&path);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DubError;
    use crate::testing::{test_options, FakeMedia, FakeSynthesizer, FakeTranslator, RecordingProgress};

    const EPSILON: f64 = 0.010;

    fn run(
        segments: &[TranscriptSegment],
        clip_duration: f64,
        synth: &FakeSynthesizer,
    ) -> DubResult<(Timeline, TempScope)> {
        let translator = FakeTranslator::default();
        let media = FakeMedia::new(clip_duration);
        let options = test_options();
        let scope = TempScope::new()?;
        let progress = RecordingProgress::default();
        let timeline = Resynchronizer::new(&translator, synth, &media, &options).run(
            segments,
            clip_duration,
            &scope,
            &progress,
        )?;
        Ok((timeline, scope))
    }

    #[test]
    fn fit_choice() {
        assert_eq!(choose_fit(4.0, 5.0), Fit::StretchAudio { rate: 0.8 });
        assert_eq!(choose_fit(5.0, 5.0), Fit::StretchAudio { rate: 1.0 });
        match choose_fit(6.0, 5.0) {
            Fit::RetimeVideo { speed } => assert!((speed - 5.0 / 6.0).abs() < 1e-12),
            other => panic!("unexpected fit {:?}", other),
        }
    }

    #[test]
    fn video_speed_is_always_below_one() {
        for speech in [5.01, 6.0, 9.5, 40.0] {
            for window in [0.2, 1.0, 5.0] {
                if let Fit::RetimeVideo { speed } = choose_fit(speech, window) {
                    assert!(speed < 1.0);
                    assert!(speed > 0.0);
                } else {
                    assert!(speech <= window);
                }
            }
        }
    }

    #[test]
    fn retimed_clip_lasts_as_long_as_the_speech() {
        let (start, end, speech) = (2.0, 4.5, 3.7);
        match choose_fit(speech, end - start) {
            Fit::RetimeVideo { speed } => {
                let clip = VideoClip::subclip(start, end).with_speed(speed);
                assert!((clip.duration() - speech).abs() < 1e-9);
            }
            other => panic!("unexpected fit {:?}", other),
        }
    }

    #[test]
    fn clamping() {
        let seg = TranscriptSegment::new(8.0, 12.0, "x");
        assert_eq!(clamp_window(&seg, 10.0), Window::Span { start: 8.0, end: 10.0 });
        assert_eq!(clamp_window(&seg, 8.0), Window::PastEnd);
        assert_eq!(clamp_window(&seg, 7.0), Window::PastEnd);
        let degenerate = TranscriptSegment::new(3.0, 3.0, "x");
        assert_eq!(clamp_window(&degenerate, 10.0), Window::Empty);
    }

    #[test]
    fn short_speech_is_stretched_to_fill_window() {
        // 4.4s synthesized -> 4.0s after the 1.10x baseline
        let synth = FakeSynthesizer::with_durations([4.4]);
        let segments = [TranscriptSegment::new(0.0, 5.0, "hello world")];
        let (timeline, _scope) = run(&segments, 10.0, &synth).unwrap();

        assert_eq!(timeline.len(), 1);
        let pair = &timeline.pairs()[0];
        match pair.fit {
            Fit::StretchAudio { rate } => assert!((rate - 0.8).abs() < EPSILON),
            other => panic!("unexpected fit {:?}", other),
        }
        assert!((pair.audio.duration_secs() - 5.0).abs() < EPSILON);
        assert_eq!(pair.video, VideoClip::subclip(0.0, 5.0));
        assert!((pair.duration() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn long_speech_retimes_video() {
        // 6.6s synthesized -> 6.0s after the 1.10x baseline
        let synth = FakeSynthesizer::with_durations([6.6]);
        let segments = [TranscriptSegment::new(0.0, 5.0, "hello world")];
        let (timeline, _scope) = run(&segments, 10.0, &synth).unwrap();

        let pair = &timeline.pairs()[0];
        assert!((pair.audio.duration_secs() - 6.0).abs() < EPSILON);
        assert!((pair.video.speed - 5.0 / 6.0).abs() < EPSILON);
        assert!((pair.video.window() - 5.0).abs() < 1e-12);
        assert!((pair.video.duration() - pair.audio.duration_secs()).abs() < EPSILON);
    }

    #[test]
    fn segments_past_end_stop_processing() {
        let synth = FakeSynthesizer::with_durations([1.0, 1.0, 1.0, 1.0]);
        let segments = [
            TranscriptSegment::new(0.0, 2.0, "one"),
            TranscriptSegment::new(2.0, 2.0, "empty"),
            TranscriptSegment::new(3.0, 6.0, "clipped"),
            TranscriptSegment::new(6.0, 7.0, "past end"),
            TranscriptSegment::new(6.5, 8.0, "also past end"),
        ];
        let (timeline, _scope) = run(&segments, 5.0, &synth).unwrap();

        let indices: Vec<usize> = timeline.pairs().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(timeline.pairs()[1].video, VideoClip::subclip(3.0, 5.0));
        assert!((timeline.pairs()[1].audio.duration_secs() - 2.0).abs() < EPSILON);
        assert_eq!(synth.calls(), 2);
    }

    #[test]
    fn order_follows_transcript() {
        let synth = FakeSynthesizer::with_durations([0.5, 3.0, 0.8, 2.5]);
        let segments = [
            TranscriptSegment::new(0.0, 1.0, "a"),
            TranscriptSegment::new(1.0, 2.0, "b"),
            TranscriptSegment::new(1.0, 3.5, "c"),
            TranscriptSegment::new(4.0, 6.0, "d"),
        ];
        let (timeline, _scope) = run(&segments, 10.0, &synth).unwrap();

        let texts: Vec<&str> = timeline.pairs().iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["[hi] a", "[hi] b", "[hi] c", "[hi] d"]);
        let starts: Vec<f64> = timeline.pairs().iter().map(|p| p.video.start).collect();
        assert_eq!(starts, vec![0.0, 1.0, 1.0, 4.0]);
    }

    #[test]
    fn synthesized_files_do_not_accumulate() {
        let synth = FakeSynthesizer::with_durations([1.0; 6]);
        let segments: Vec<TranscriptSegment> = (0..6)
            .map(|i| TranscriptSegment::new(i as f64, i as f64 + 1.0, "line"))
            .collect();
        let (timeline, scope) = run(&segments, 10.0, &synth).unwrap();
        assert_eq!(timeline.len(), 6);
        assert_eq!(scope.live_files(), 0);
    }

    #[test]
    fn synthesis_failure_aborts_the_run() {
        let synth = FakeSynthesizer::with_durations([1.0]).failing_on("[hi] bad");
        let segments = [
            TranscriptSegment::new(0.0, 1.0, "good"),
            TranscriptSegment::new(1.0, 2.0, "bad"),
            TranscriptSegment::new(2.0, 3.0, "never reached"),
        ];
        let err = run(&segments, 10.0, &synth).unwrap_err();
        assert!(matches!(err, DubError::Synthesis(_)));
        assert_eq!(synth.calls(), 2);
    }

    #[test]
    fn translation_failure_aborts_the_run() {
        let translator = FakeTranslator::failing();
        let synth = FakeSynthesizer::with_durations([1.0]);
        let media = FakeMedia::new(10.0);
        let options = test_options();
        let scope = TempScope::new().unwrap();
        let segments = [TranscriptSegment::new(0.0, 1.0, "hello")];
        let err = Resynchronizer::new(&translator, &synth, &media, &options)
            .run(&segments, 10.0, &scope, &RecordingProgress::default())
            .unwrap_err();
        assert!(matches!(err, DubError::Translation(_)));
        assert_eq!(synth.calls(), 0);
    }

    #[test]
    fn progress_reports_each_stage() {
        let translator = FakeTranslator::default();
        let synth = FakeSynthesizer::with_durations([2.2]);
        let media = FakeMedia::new(10.0);
        let options = test_options();
        let scope = TempScope::new().unwrap();
        let progress = RecordingProgress::default();
        let segments = [TranscriptSegment::new(1.0, 4.0, "  hello world ")];
        Resynchronizer::new(&translator, &synth, &media, &options)
            .run(&segments, 10.0, &scope, &progress)
            .unwrap();

        let messages = progress.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], "Seg 0: 1.00-4.00s\nEN: hello world");
        assert_eq!(messages[1], "HI: [hi] hello world");
        assert_eq!(messages[2], "Audio @1.10x: 2.00s");
    }

    #[test]
    fn subtitles_follow_output_timeline() {
        let synth = FakeSynthesizer::with_durations([1.1, 6.6]);
        let segments = [
            TranscriptSegment::new(2.0, 4.0, "first"),
            TranscriptSegment::new(4.0, 9.0, "second"),
        ];
        let (timeline, _scope) = run(&segments, 10.0, &synth).unwrap();
        let subtitle = timeline.subtitles();

        assert_eq!(subtitle.len(), 2);
        let first = &subtitle.entries[0];
        let second = &subtitle.entries[1];
        assert!((first.start - 0.0).abs() < 1e-9);
        assert!((first.end - 2.0).abs() < 1e-9);
        assert!((second.start - 2.0).abs() < 1e-9);
        assert!((second.end - 8.0).abs() < EPSILON);
        assert_eq!(second.text, "[hi] second");
    }
}
