use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::api::sync::ApiBuilder;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::audio::read_wav;
use crate::config::WhisperModelSize;
use crate::error::{DubError, DubResult};
use crate::transcript::{TranscriptSegment, Transcriber};

/// Seconds per timestamp token step.
const TIMESTAMP_STEP: f64 = 0.02;
/// Number of timestamp tokens after `<|0.00|>` (30 s window).
const TIMESTAMP_COUNT: u32 = 1500;
/// Fallback id of `<|0.00|>` for tokenizers that do not name it.
const DEFAULT_TIMESTAMP_BEGIN: u32 = 50364;
/// Duration assumed for trailing text that never got a closing timestamp.
const OPEN_SEGMENT_SECS: f64 = 5.0;

fn hz_to_mel(hz: f64) -> f64 {
    // Slaney scale: linear below 1 kHz, logarithmic above
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let log_step = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        MIN_LOG_HZ / F_SP + (hz / MIN_LOG_HZ).ln() / log_step
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * ((mel - min_log_mel) * log_step).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-normalized triangular mel filter bank, row-major `[n_mels][N_FFT / 2 + 1]`.
/// Matches the filters Whisper was trained with.
fn mel_filters(n_mels: usize) -> Vec<f32> {
    let n_freqs = m::N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (lower, center, upper) = (edges[band], edges[band + 1], edges[band + 2]);
        let area_norm = 2.0 / (upper - lower);
        for bin in 0..n_freqs {
            let freq = bin as f64 * sample_rate / m::N_FFT as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            filters[band * n_freqs + bin] = (rising.min(falling).max(0.0) * area_norm) as f32;
        }
    }
    filters
}

/// Whisper often hallucinates on music or silence: unrelated scripts, or one
/// sentence repeated over and over.
fn looks_hallucinated(text: &str) -> bool {
    if text.chars().count() < 2 || text == "[BLANK_AUDIO]" {
        return true;
    }

    let foreign_script = text.chars().any(|c| {
        matches!(c,
            '\u{0D80}'..='\u{0DFF}' |  // Sinhala
            '\u{1780}'..='\u{17FF}' |  // Khmer
            '\u{1200}'..='\u{137F}'    // Ethiopic
        )
    });
    if foreign_script {
        return true;
    }

    let mut counts = std::collections::HashMap::new();
    for sentence in text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        *counts.entry(sentence).or_insert(0usize) += 1;
    }
    counts.values().any(|&n| n >= 3)
}

/// Split a decoded span at sentence ends, sharing its time range in proportion
/// to character count. The last piece absorbs rounding so spans stay contiguous.
fn split_sentences(text: &str, start: f64, end: f64) -> Vec<TranscriptSegment> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    let total_chars: usize = sentences.iter().map(|s| s.chars().count()).sum();
    if sentences.len() <= 1 || total_chars == 0 {
        return vec![TranscriptSegment::new(start, end, text.trim())];
    }

    let duration = end - start;
    let last = sentences.len() - 1;
    let mut cursor = start;
    sentences
        .into_iter()
        .enumerate()
        .map(|(i, sentence)| {
            let seg_end = if i == last {
                end
            } else {
                cursor + duration * sentence.chars().count() as f64 / total_chars as f64
            };
            let seg = TranscriptSegment::new(cursor, seg_end, sentence);
            cursor = seg_end;
            seg
        })
        .collect()
}

/// Token ids the decoder needs, resolved once from the tokenizer.
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    language: u32,
    timestamp_begin: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer, language: &str) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Token not found: {}", token))
        };
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            language: id(&format!("<|{}|>", language))?,
            timestamp_begin: tokenizer
                .token_to_id("<|0.00|>")
                .unwrap_or(DEFAULT_TIMESTAMP_BEGIN),
        })
    }

    fn is_timestamp(&self, token: u32) -> bool {
        (self.timestamp_begin..=self.timestamp_begin + TIMESTAMP_COUNT).contains(&token)
    }

    fn seconds(&self, token: u32) -> f64 {
        (token - self.timestamp_begin) as f64 * TIMESTAMP_STEP
    }
}

/// Whisper model with its tokenizer and filter bank.
pub struct WhisperModel {
    model: m::model::Whisper,
    tokenizer: Tokenizer,
    config: Config,
    device: Device,
    mel_filters: Vec<f32>,
    tokens: SpecialTokens,
}

impl WhisperModel {
    /// Download (first run only) and load a model that transcribes `language`.
    pub fn load(
        model_size: WhisperModelSize,
        cache_dir: &Path,
        device: Device,
        language: &str,
    ) -> Result<Self> {
        info!("Loading Whisper {} model...", model_size);

        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .build()
            .context("Failed to create HuggingFace API")?;
        let repo = api.model(model_size.repo_id().to_string());

        let config_path = repo.get("config.json").context("Failed to download config.json")?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        debug!("Weights: {}", weights_path.display());

        let config: Config = serde_json::from_str(
            &std::fs::read_to_string(&config_path).context("Failed to read config.json")?,
        )
        .context("Failed to parse config.json")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer, language)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], candle_core::DType::F32, &device)
                .context("Failed to load model weights")?
        };
        let model = m::model::Whisper::load(&vb, config.clone())
            .context("Failed to create Whisper model")?;

        let mel_filters = mel_filters(config.num_mel_bins);

        info!("Model loaded successfully (device: {:?})", device);

        Ok(Self {
            model,
            tokenizer,
            config,
            device,
            mel_filters,
            tokens,
        })
    }

    /// Transcribe 16 kHz mono samples into time-ordered segments.
    pub fn transcribe_samples(&mut self, samples: &[f32]) -> Result<Vec<TranscriptSegment>> {
        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let total_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, total_frames), &self.device)?;

        info!(
            "Transcribing {:.2} seconds of audio ({} windows)",
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            total_frames.div_ceil(m::N_FRAMES)
        );

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < total_frames {
            let window = usize::min(total_frames - seek, m::N_FRAMES);
            let offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;

            let mut chunk = mel.narrow(2, seek, window)?;
            if window < m::N_FRAMES {
                let padding = Tensor::zeros(
                    (1, n_mels, m::N_FRAMES - window),
                    candle_core::DType::F32,
                    &self.device,
                )?;
                chunk = Tensor::cat(&[&chunk, &padding], 2)?;
            }

            self.model.reset_kv_cache();
            let features = self.model.encoder.forward(&chunk, true)?;
            let (spans, consumed) = self.decode_window(&features)?;

            for (start, end, tokens) in spans {
                let text = self
                    .tokenizer
                    .decode(&tokens, true)
                    .map_err(|e| anyhow!("Failed to decode tokens: {}", e))?;
                let text = text.trim();
                if text.is_empty() || looks_hallucinated(text) {
                    continue;
                }
                for seg in split_sentences(text, offset + start, offset + end) {
                    debug!("Segment: {:.2}-{:.2}: {}", seg.start, seg.end, seg.text);
                    segments.push(seg);
                }
            }

            // advance by what the model reported consuming, at least one frame
            seek += if consumed > 0.0 {
                ((consumed * m::SAMPLE_RATE as f64 / m::HOP_LENGTH as f64) as usize).max(1)
            } else {
                window
            };
        }

        info!("Transcription complete: {} segments", segments.len());
        Ok(segments)
    }

    /// Greedy-decode one 30 s window into `(start, end, text tokens)` spans.
    /// Also returns the last timestamp seen, which is how far the window was consumed.
    fn decode_window(&mut self, features: &Tensor) -> Result<(Vec<(f64, f64, Vec<u32>)>, f64)> {
        let t = &self.tokens;
        // the opening <|0.00|> puts the decoder in timestamp mode
        let mut prompt = vec![t.sot, t.language, t.transcribe, t.timestamp_begin];
        let mut emitted = vec![t.timestamp_begin];
        let mut consumed = 0.0_f64;

        for step in 0..self.config.max_target_positions / 2 {
            let input = Tensor::new(prompt.as_slice(), &self.device)?.unsqueeze(0)?;
            let hidden = self.model.decoder.forward(&input, features, step == 0)?;
            let (_, seq_len, _) = hidden.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&hidden.narrow(1, seq_len - 1, 1)?)?
                .squeeze(0)?
                .squeeze(0)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;

            if next == t.eot {
                break;
            }
            if t.is_timestamp(next) {
                consumed = t.seconds(next);
            }
            emitted.push(next);
            prompt.push(next);

            // four identical tokens in a row: the decoder is stuck
            let n = emitted.len();
            if n >= 4 && emitted[n - 4..].iter().all(|&tok| tok == next) {
                emitted.truncate(n - 3);
                break;
            }
        }

        let spans = self.spans(&emitted);
        if let Some((_, end, _)) = spans.last() {
            consumed = consumed.max(*end);
        }
        Ok((spans, consumed))
    }

    /// Group `<|t0|> text... <|t1|>` runs into spans. A closing timestamp also opens the next span.
    fn spans(&self, tokens: &[u32]) -> Vec<(f64, f64, Vec<u32>)> {
        let t = &self.tokens;
        let mut spans = Vec::new();
        let mut open: Option<f64> = None;
        let mut text = Vec::new();

        for &token in tokens {
            if t.is_timestamp(token) {
                let time = t.seconds(token);
                if let Some(start) = open {
                    if !text.is_empty() {
                        spans.push((start, time, std::mem::take(&mut text)));
                    }
                }
                open = Some(time);
            } else if open.is_some() && token < t.eot {
                text.push(token);
            }
        }

        if let (Some(start), false) = (open, text.is_empty()) {
            spans.push((start, (start + OPEN_SEGMENT_SECS).min(30.0), text));
        }
        spans
    }
}

/// Process-wide Whisper handle. The decoder keeps a KV cache, so calls are serialized.
pub struct WhisperTranscriber {
    model: Mutex<WhisperModel>,
}

impl WhisperTranscriber {
    pub fn new(model: WhisperModel) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &Path) -> DubResult<Vec<TranscriptSegment>> {
        let waveform = read_wav(audio)?;
        if waveform.sample_rate != m::SAMPLE_RATE as u32 {
            return Err(DubError::Transcription(format!(
                "expected {} Hz audio, got {} Hz",
                m::SAMPLE_RATE,
                waveform.sample_rate
            )));
        }
        let mut model = self
            .model
            .lock()
            .map_err(|_| DubError::Transcription("whisper model lock poisoned".into()))?;
        model
            .transcribe_samples(&waveform.samples)
            .map_err(|e| DubError::Transcription(format!("{:#}", e)))
    }
}
