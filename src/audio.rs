use std::ffi::OsStr;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{DubError, DubResult};

extern crate ffmpeg_next as ffmpeg;

pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Known video file extensions
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpeg", "mpg", "3gp",
];

/// Check if the file is a video file based on extension
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Mono PCM audio, samples normalized to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn silence(duration_secs: f64, sample_rate: u32) -> Self {
        let len = (duration_secs * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration measured from the sample count.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Join clips end to end. All clips must share one sample rate.
pub fn concatenate(clips: &[Waveform]) -> DubResult<Waveform> {
    let Some(first) = clips.first() else {
        return Err(DubError::Assembly("no audio clips to concatenate".into()));
    };
    let sample_rate = first.sample_rate;
    let total: usize = clips.iter().map(Waveform::len).sum();
    let mut samples = Vec::with_capacity(total);
    for (i, clip) in clips.iter().enumerate() {
        if clip.sample_rate != sample_rate {
            return Err(DubError::Assembly(format!(
                "audio clip {} is {} Hz, expected {} Hz",
                i, clip.sample_rate, sample_rate
            )));
        }
        samples.extend_from_slice(&clip.samples);
    }
    Ok(Waveform::new(samples, sample_rate))
}

/// Write mono 16-bit PCM WAV.
pub fn write_wav(path: &Path, waveform: &Waveform) -> DubResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: waveform.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in &waveform.samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a WAV file, downmixing to mono.
pub fn read_wav(path: &Path) -> DubResult<Waveform> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    debug!(
        "WAV file: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok(Waveform::new(samples, spec.sample_rate))
}

/// Decode the best audio stream of any media file to mono f32 at `sample_rate`.
/// Uses ffmpeg-next (links against system FFmpeg libraries).
pub fn decode_audio(input: &Path, sample_rate: u32) -> DubResult<Waveform> {
    ffmpeg::init()?;

    let mut ictx = ffmpeg::format::input(&input)?;

    let audio_stream_index = ictx
        .streams()
        .best(ffmpeg::media::Type::Audio)
        .ok_or_else(|| {
            DubError::Media(format!("no audio stream found in {}", input.display()))
        })?
        .index();

    let audio_params = ictx
        .stream(audio_stream_index)
        .ok_or_else(|| DubError::Media("audio stream disappeared".into()))?
        .parameters();

    let decoder_context = ffmpeg::codec::context::Context::from_parameters(audio_params)?;
    let mut decoder = decoder_context.decoder().audio()?;

    let mut resampler = ffmpeg::software::resampling::context::Context::get(
        decoder.format(),
        decoder.channel_layout(),
        decoder.rate(),
        ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
        ffmpeg::ChannelLayout::MONO,
        sample_rate,
    )?;

    let mut samples: Vec<f32> = Vec::new();

    for (stream, packet) in ictx.packets() {
        if stream.index() != audio_stream_index {
            continue;
        }
        // a corrupt packet only loses its own samples
        decoder.send_packet(&packet).ok();
        drain_decoder(&mut decoder, &mut resampler, &mut samples)?;
    }

    decoder.send_eof().ok();
    drain_decoder(&mut decoder, &mut resampler, &mut samples)?;

    // the resampler holds back a few samples of delay
    loop {
        let mut resampled = ffmpeg::frame::Audio::empty();
        match resampler.flush(&mut resampled) {
            Ok(_) if resampled.samples() > 0 => append_samples(&resampled, &mut samples),
            _ => break,
        }
    }

    debug!(
        "Decoded {} samples at {} Hz from {}",
        samples.len(),
        sample_rate,
        input.display()
    );
    Ok(Waveform::new(samples, sample_rate))
}

fn drain_decoder(
    decoder: &mut ffmpeg::decoder::Audio,
    resampler: &mut ffmpeg::software::resampling::context::Context,
    samples: &mut Vec<f32>,
) -> DubResult<()> {
    let mut decoded = ffmpeg::frame::Audio::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let mut resampled = ffmpeg::frame::Audio::empty();
        resampler.run(&decoded, &mut resampled)?;
        if resampled.samples() > 0 {
            append_samples(&resampled, samples);
        }
    }
    Ok(())
}

fn append_samples(frame: &ffmpeg::frame::Audio, samples: &mut Vec<f32>) {
    let data: &[f32] = bytemuck::cast_slice(frame.data(0));
    samples.extend_from_slice(&data[..frame.samples()]);
}

/// Extract a video's audio track as a 16 kHz mono WAV, the format Whisper expects.
/// Returns the extracted duration in seconds.
pub fn extract_audio(input: &Path, dest: &Path) -> DubResult<f64> {
    let waveform = decode_audio(input, WHISPER_SAMPLE_RATE)?;
    write_wav(dest, &waveform)?;
    info!(
        "Audio extracted ({:.2} seconds) to {}",
        waveform.duration_secs(),
        dest.display()
    );
    Ok(waveform.duration_secs())
}

/// Container duration in seconds.
pub fn probe_duration(input: &Path) -> DubResult<f64> {
    ffmpeg::init()?;
    let ictx = ffmpeg::format::input(&input)?;
    // AV_TIME_BASE units (microseconds)
    let duration_us = ictx.duration();
    if duration_us <= 0 {
        return Err(DubError::Media(format!(
            "could not determine duration of {}",
            input.display()
        )));
    }
    Ok(duration_us as f64 / 1_000_000.0)
}
