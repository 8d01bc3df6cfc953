//! Video-side operations.
//!
//! Subclips are lazy: a [`VideoClip`] only names a window of the source and a
//! playback speed. The whole timeline is cut, retimed, joined and muxed with
//! the dubbed track in one ffmpeg filter graph.

use std::path::{Path, PathBuf};
use std::process::Command;

use ffmpeg_next as ffmpeg;
use tracing::debug;

use crate::audio::{self, Waveform};
use crate::config::EncodeOptions;
use crate::error::{DubError, DubResult};

/// A window `[start, end)` of the source video, played at `speed`.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoClip {
    pub start: f64,
    pub end: f64,
    /// Playback-speed multiplier. `1.0` plays the window as recorded; the
    /// clip lasts `(end - start) / speed` seconds.
    pub speed: f64,
}

impl VideoClip {
    pub fn subclip(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            speed: 1.0,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn window(&self) -> f64 {
        self.end - self.start
    }

    pub fn duration(&self) -> f64 {
        self.window() / self.speed
    }
}

/// Source video frame rate as a rational, e.g. `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: i32,
    pub den: i32,
}

impl FrameRate {
    pub fn new(num: i32, den: i32) -> DubResult<Self> {
        if num <= 0 || den <= 0 {
            return Err(DubError::Media(format!("invalid frame rate {}/{}", num, den)));
        }
        Ok(Self { num, den })
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Everything needed to write the dubbed video.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub source: PathBuf,
    pub frame_rate: FrameRate,
    pub clips: Vec<VideoClip>,
    /// Concatenated dub track (WAV).
    pub audio: PathBuf,
    pub encode: EncodeOptions,
}

/// Media operations the pipeline relies on.
pub trait MediaEngine: Send + Sync {
    fn probe_duration(&self, video: &Path) -> DubResult<f64>;

    fn probe_frame_rate(&self, video: &Path) -> DubResult<FrameRate>;

    /// Write the source audio as 16 kHz mono WAV to `dest`.
    fn extract_audio(&self, video: &Path, dest: &Path) -> DubResult<()>;

    /// Decode any audio file to mono at `sample_rate`.
    fn load_waveform(&self, path: &Path, sample_rate: u32) -> DubResult<Waveform>;

    fn render(&self, plan: &RenderPlan, dest: &Path) -> DubResult<()>;

    fn reencode(&self, src: &Path, dest: &Path, options: &EncodeOptions) -> DubResult<()>;
}

fn format_time(value: f64) -> String {
    format!("{value:.6}")
}

/// Frames given to each clip in the output.
///
/// Boundaries are rounded on the cumulative output timeline, so the picture
/// never drifts more than half a frame from the dub track however many clips
/// there are. A clip shorter than a frame may get none.
pub fn frame_counts(clips: &[VideoClip], frame_rate: FrameRate) -> Vec<u64> {
    let fps = frame_rate.as_f64();
    let mut elapsed = 0.0;
    let mut emitted = 0u64;
    clips
        .iter()
        .map(|clip| {
            elapsed += clip.duration();
            let boundary = (elapsed * fps).round().max(0.0) as u64;
            let frames = boundary.saturating_sub(emitted);
            emitted += frames;
            frames
        })
        .collect()
}

/// `filter_complex` graph: cut, retime and pin every clip to its frame
/// count, then concatenate.
///
/// Each cut starts half a frame before the frame at or below the window
/// start, so even a window narrower than one frame interval yields a frame.
/// `tpad` repeats the last frame when the cut runs short.
pub fn build_filter_graph(clips: &[VideoClip], frame_rate: FrameRate) -> String {
    let fps = frame_rate.as_f64();
    let counts = frame_counts(clips, frame_rate);
    let mut graph = String::new();
    let mut labels = String::new();
    let mut joined = 0;
    for (i, (clip, frames)) in clips.iter().zip(counts).enumerate() {
        if frames == 0 {
            continue;
        }
        let first_frame = (clip.start * fps + 1e-9).floor();
        let cut_start = ((first_frame - 0.5) / fps).max(0.0);
        let pts = if (clip.speed - 1.0).abs() < f64::EPSILON {
            "PTS-STARTPTS".to_string()
        } else {
            format!("(PTS-STARTPTS)/{}", format_time(clip.speed))
        };
        let length = frames as f64 / fps;
        graph.push_str(&format!(
            "[0:v]trim=start={}:end={},setpts={},fps={},\
             tpad=stop_mode=clone:stop_duration={},trim=end_frame={},setpts=PTS-STARTPTS[v{}];",
            format_time(cut_start),
            format_time(clip.end),
            pts,
            frame_rate,
            format_time(length),
            frames,
            i
        ));
        labels.push_str(&format!("[v{}]", i));
        joined += 1;
    }
    graph.push_str(&format!("{}concat=n={}:v=1:a=0[vout]", labels, joined));
    graph
}

/// Frame rate of the best video stream.
pub fn probe_frame_rate(input: &Path) -> DubResult<FrameRate> {
    ffmpeg::init()?;
    let ictx = ffmpeg::format::input(&input)?;
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| DubError::Media(format!("no video stream found in {}", input.display())))?;
    let mut rate = stream.avg_frame_rate();
    if rate.numerator() <= 0 || rate.denominator() <= 0 {
        rate = stream.rate();
    }
    FrameRate::new(rate.numerator(), rate.denominator())
}

fn push_codecs(args: &mut Vec<String>, options: &EncodeOptions) {
    args.extend(["-c:v".into(), options.video_codec.clone()]);
    if let Some(bitrate) = &options.video_bitrate {
        args.extend(["-b:v".into(), bitrate.clone()]);
    }
    args.extend([
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        options.audio_codec.clone(),
        "-b:a".into(),
        options.audio_bitrate.clone(),
        "-movflags".into(),
        "+faststart".into(),
    ]);
}

/// Arguments for the single pass that writes the dubbed video. The source's
/// own audio is dropped; only the dub track is mapped.
pub fn build_render_args(plan: &RenderPlan, dest: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        plan.source.to_string_lossy().into_owned(),
        "-i".into(),
        plan.audio.to_string_lossy().into_owned(),
        "-filter_complex".into(),
    ];
    let mut graph = build_filter_graph(&plan.clips, plan.frame_rate);
    if let Some(width) = plan.encode.width {
        graph = graph.replace("[vout]", "[joined];[joined]") + &format!("scale={}:-2[vout]", width);
    }
    args.push(graph);
    args.extend([
        "-map".into(),
        "[vout]".into(),
        "-map".into(),
        "1:a".into(),
    ]);
    push_codecs(&mut args, &plan.encode);
    args.push(dest.to_string_lossy().into_owned());
    args
}

/// Arguments for a plain re-encode, optionally downscaled.
pub fn build_reencode_args(src: &Path, dest: &Path, options: &EncodeOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        src.to_string_lossy().into_owned(),
    ];
    if let Some(width) = options.width {
        // -2 keeps the height even, as libx264 requires
        args.extend(["-vf".into(), format!("scale={}:-2", width)]);
    }
    push_codecs(&mut args, options);
    args.push(dest.to_string_lossy().into_owned());
    args
}

/// ffmpeg-next for decoding and probing, the ffmpeg binary for filter graphs and encoding.
pub struct Ffmpeg {
    program: String,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
        }
    }
}

impl Ffmpeg {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> DubResult<()> {
        debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| DubError::Media(format!("failed to spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(DubError::from_process_failure(
                &self.program,
                output.status.code(),
                &output.stderr,
            ));
        }
        Ok(())
    }
}

impl MediaEngine for Ffmpeg {
    fn probe_duration(&self, video: &Path) -> DubResult<f64> {
        audio::probe_duration(video)
    }

    fn probe_frame_rate(&self, video: &Path) -> DubResult<FrameRate> {
        probe_frame_rate(video)
    }

    fn extract_audio(&self, video: &Path, dest: &Path) -> DubResult<()> {
        audio::extract_audio(video, dest).map(|_| ())
    }

    fn load_waveform(&self, path: &Path, sample_rate: u32) -> DubResult<Waveform> {
        audio::decode_audio(path, sample_rate)
    }

    fn render(&self, plan: &RenderPlan, dest: &Path) -> DubResult<()> {
        if frame_counts(&plan.clips, plan.frame_rate).iter().all(|&n| n == 0) {
            return Err(DubError::Assembly("nothing to render".into()));
        }
        self.run(&build_render_args(plan, dest))
    }

    fn reencode(&self, src: &Path, dest: &Path, options: &EncodeOptions) -> DubResult<()> {
        self.run(&build_reencode_args(src, dest, options))
    }
}
