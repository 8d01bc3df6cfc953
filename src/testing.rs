//! In-process stand-ins for the external services, shared by unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::{self, Waveform};
use crate::config::{DubOptions, EncodeOptions};
use crate::error::{DubError, DubResult};
use crate::media::{FrameRate, MediaEngine, RenderPlan};
use crate::pipeline::{Dubber, ProgressSink, Services};
use crate::speech::Synthesizer;
use crate::transcript::{TranscriptSegment, Transcriber};
use crate::translate::Translator;

/// Low sample rate keeps the time-stretch cheap in debug builds.
pub const TEST_SAMPLE_RATE: u32 = 8_000;

pub fn test_options() -> DubOptions {
    DubOptions {
        sample_rate: TEST_SAMPLE_RATE,
        ..DubOptions::default()
    }
}

/// A 220 Hz tone.
pub fn tone(duration_secs: f64, sample_rate: u32) -> Waveform {
    let len = (duration_secs * sample_rate as f64).round() as usize;
    let samples = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.5 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
        })
        .collect();
    Waveform::new(samples, sample_rate)
}

#[derive(Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Returns fixed segments; optionally sleeps and tracks concurrent callers.
#[derive(Default)]
pub struct FakeTranscriber {
    segments: Vec<TranscriptSegment>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(segments: Vec<TranscriptSegment>) -> Self {
        Self {
            segments,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Transcriber for FakeTranscriber {
    fn transcribe(&self, audio: &Path) -> DubResult<Vec<TranscriptSegment>> {
        if !audio.exists() {
            return Err(DubError::Transcription(format!(
                "{} does not exist",
                audio.display()
            )));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.segments.clone())
    }
}

/// Prefixes the text with `[hi] `.
#[derive(Default)]
pub struct FakeTranslator {
    fail: bool,
}

impl FakeTranslator {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Translator for FakeTranslator {
    fn translate(&self, text: &str, _source: &str, _target: &str) -> DubResult<String> {
        if self.fail {
            return Err(DubError::Translation("service unavailable".into()));
        }
        Ok(format!("[hi] {}", text))
    }
}

/// Writes tones whose durations are taken in call order. When the queue runs
/// out the last duration repeats.
pub struct FakeSynthesizer {
    sample_rate: u32,
    durations: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    fail_on: Option<String>,
    calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub fn with_durations(durations: impl IntoIterator<Item = f64>) -> Self {
        Self {
            sample_rate: TEST_SAMPLE_RATE,
            durations: Mutex::new(durations.into_iter().collect()),
            last: Mutex::new(1.0),
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Synthesizer for FakeSynthesizer {
    fn file_suffix(&self) -> &str {
        ".wav"
    }

    fn synthesize(&self, text: &str, _language: &str, dest: &Path) -> DubResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.as_deref() == Some(text) {
            return Err(DubError::Synthesis(format!("cannot speak {:?}", text)));
        }
        let duration = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.durations.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        };
        audio::write_wav(dest, &tone(duration, self.sample_rate))
    }
}

/// File-backed media engine that never touches a real video.
///
/// `render` writes `bytes_per_clip` bytes per clip; `reencode` writes the
/// configured fraction of its input size.
pub struct FakeMedia {
    duration: f64,
    bytes_per_clip: u64,
    reencode_ratio: f64,
    fail_reencode: bool,
    renders: Mutex<Vec<RenderPlan>>,
    reencodes: AtomicUsize,
}

impl FakeMedia {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            bytes_per_clip: 1_000,
            reencode_ratio: 0.5,
            fail_reencode: false,
            renders: Mutex::new(Vec::new()),
            reencodes: AtomicUsize::new(0),
        }
    }

    pub fn with_bytes_per_clip(mut self, bytes: u64) -> Self {
        self.bytes_per_clip = bytes;
        self
    }

    pub fn with_reencode_ratio(mut self, ratio: f64) -> Self {
        self.reencode_ratio = ratio;
        self
    }

    pub fn failing_reencode(mut self) -> Self {
        self.fail_reencode = true;
        self
    }

    pub fn renders(&self) -> Vec<RenderPlan> {
        self.renders.lock().unwrap().clone()
    }

    pub fn reencodes(&self) -> usize {
        self.reencodes.load(Ordering::SeqCst)
    }
}

impl MediaEngine for FakeMedia {
    fn probe_duration(&self, _video: &Path) -> DubResult<f64> {
        Ok(self.duration)
    }

    fn probe_frame_rate(&self, _video: &Path) -> DubResult<FrameRate> {
        FrameRate::new(25, 1)
    }

    fn extract_audio(&self, _video: &Path, dest: &Path) -> DubResult<()> {
        audio::write_wav(dest, &tone(0.1, audio::WHISPER_SAMPLE_RATE))
    }

    fn load_waveform(&self, path: &Path, sample_rate: u32) -> DubResult<Waveform> {
        let waveform = audio::read_wav(path)?;
        if waveform.sample_rate != sample_rate {
            return Err(DubError::Media(format!(
                "{} is {} Hz, wanted {} Hz",
                path.display(),
                waveform.sample_rate,
                sample_rate
            )));
        }
        Ok(waveform)
    }

    fn render(&self, plan: &RenderPlan, dest: &Path) -> DubResult<()> {
        if !plan.audio.exists() {
            return Err(DubError::Assembly("dub track missing".into()));
        }
        let size = self.bytes_per_clip * plan.clips.len() as u64;
        std::fs::write(dest, vec![0u8; size as usize])?;
        self.renders.lock().unwrap().push(plan.clone());
        Ok(())
    }

    fn reencode(&self, src: &Path, dest: &Path, _options: &EncodeOptions) -> DubResult<()> {
        self.reencodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_reencode {
            return Err(DubError::Media("encoder crashed".into()));
        }
        let size = std::fs::metadata(src)?.len();
        let out = (size as f64 * self.reencode_ratio).round() as usize;
        std::fs::write(dest, vec![0u8; out])?;
        Ok(())
    }
}

/// A dubber wired entirely to fakes.
pub fn fake_dubber(
    transcriber: Arc<FakeTranscriber>,
    synthesizer: Arc<FakeSynthesizer>,
    media: Arc<FakeMedia>,
) -> Dubber {
    let services = Services {
        transcriber,
        translator: Arc::new(FakeTranslator::default()),
        synthesizer,
        media,
    };
    Dubber::new(services, test_options())
}
