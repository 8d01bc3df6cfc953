use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

/// Language spoken in the source videos.
pub const SOURCE_LANGUAGE: &str = "en";
/// Language of the dubbed track.
pub const TARGET_LANGUAGE: &str = "hi";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WhisperModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModelSize {
    pub fn repo_id(&self) -> &'static str {
        match self {
            Self::Tiny => "openai/whisper-tiny",
            Self::Base => "openai/whisper-base",
            Self::Small => "openai/whisper-small",
            Self::Medium => "openai/whisper-medium",
            Self::Large => "openai/whisper-large-v3",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for WhisperModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Device {
    #[default]
    /// Automatically select the best available device (Metal > CUDA > CPU)
    Auto,
    /// Use CPU for inference
    Cpu,
    #[cfg(feature = "cuda")]
    /// Use CUDA GPU for inference
    Cuda,
    #[cfg(feature = "metal")]
    /// Use Metal GPU for inference (Apple Silicon)
    Metal,
}

impl Device {
    /// Resolve to a candle device. A requested GPU that is missing falls back to CPU.
    pub fn to_candle_device(&self) -> anyhow::Result<candle_core::Device> {
        match self {
            Self::Auto => Ok(Self::auto_select_device()),
            Self::Cpu => Ok(candle_core::Device::Cpu),
            #[cfg(feature = "cuda")]
            Self::Cuda => Ok(Self::gpu_or_cpu("CUDA", candle_core::Device::new_cuda(0))),
            #[cfg(feature = "metal")]
            Self::Metal => Ok(Self::gpu_or_cpu("Metal", candle_core::Device::new_metal(0))),
        }
    }

    fn auto_select_device() -> candle_core::Device {
        #[cfg(feature = "metal")]
        {
            if let Ok(device) = candle_core::Device::new_metal(0) {
                tracing::info!("Using Metal GPU acceleration");
                return device;
            }
            tracing::debug!("Metal not available, trying next option");
        }

        #[cfg(feature = "cuda")]
        {
            if let Ok(device) = candle_core::Device::new_cuda(0) {
                tracing::info!("Using CUDA GPU acceleration");
                return device;
            }
            tracing::debug!("CUDA not available, trying next option");
        }

        tracing::info!("Using CPU for inference");
        candle_core::Device::Cpu
    }

    #[cfg(any(feature = "cuda", feature = "metal"))]
    fn gpu_or_cpu(
        name: &str,
        device: candle_core::Result<candle_core::Device>,
    ) -> candle_core::Device {
        match device {
            Ok(device) => {
                tracing::info!("Using {} GPU acceleration", name);
                device
            }
            Err(e) => {
                tracing::warn!("{} not available ({}), falling back to CPU", name, e);
                candle_core::Device::Cpu
            }
        }
    }
}

/// LLM provider for translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LlmProvider {
    #[default]
    /// OpenAI API (default)
    Openai,
    /// Anthropic Claude API
    Anthropic,
    /// Google Gemini API
    Google,
    /// Local Ollama server
    Ollama,
    /// DeepSeek API
    Deepseek,
}

fn parse_speedup(value: &str) -> Result<f64, String> {
    let speedup: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number"))?;
    if speedup.is_finite() && speedup > 0.0 {
        Ok(speedup)
    } else {
        Err(format!("speed-up must be greater than zero, got {value}"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "autodub")]
#[command(version, about = "Replace a video's English speech with Hindi dubbing fitted to the original timing")]
pub struct Config {
    /// Input video file path(s); each one is dubbed as an independent job
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory for dubbed videos (default: next to each input)
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Whisper model size to use
    #[arg(short, long, value_enum, default_value = "base")]
    pub model: WhisperModelSize,

    /// LLM provider for translation
    #[arg(long, value_enum, default_value = "openai", env = "AUTODUB_LLM_PROVIDER")]
    pub llm_provider: LlmProvider,

    /// LLM API base URL (optional, for custom endpoints like Azure OpenAI)
    #[arg(long, env = "AUTODUB_LLM_URL")]
    pub llm_url: Option<String>,

    /// LLM API key for translation
    #[arg(long, env = "AUTODUB_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// LLM model name for translation
    #[arg(long, env = "AUTODUB_LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Speed-up applied to every synthesized clip before fitting it to its window
    #[arg(long, default_value = "1.10", value_parser = parse_speedup)]
    pub baseline_speedup: f64,

    /// Delivery size ceiling in MiB; larger outputs are re-encoded once
    #[arg(long, default_value_t = 49, env = "AUTODUB_MAX_SIZE_MB")]
    pub max_size_mb: u64,

    /// Maximum number of videos dubbed concurrently
    #[arg(short, long, default_value_t = 2)]
    pub jobs: usize,

    /// Also write the Hindi subtitles timed to the dubbed video
    #[arg(long)]
    pub subtitles: bool,

    /// Model cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Device to use for inference (auto selects best available: Metal > CUDA > CPU)
    #[arg(long, value_enum, default_value = "auto")]
    pub device: Device,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("autodub")
                .join("models")
        })
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn output_path(&self, input: &Path) -> PathBuf {
        let stem = input.file_stem().unwrap_or_default().to_string_lossy();
        let name = format!("{}_{}.mp4", stem, TARGET_LANGUAGE);
        match &self.output_dir {
            Some(dir) => dir.join(name),
            None => input.with_file_name(name),
        }
    }

    /// One output path per input, in order. A name that is already taken by
    /// an earlier output or by any input gets a numeric suffix.
    pub fn job_outputs(&self) -> Vec<PathBuf> {
        let mut taken: HashSet<PathBuf> = self.inputs.iter().cloned().collect();
        self.inputs
            .iter()
            .enumerate()
            .map(|(id, input)| {
                let wanted = self.output_path(input);
                let mut path = wanted.clone();
                let mut n = id;
                while taken.contains(&path) {
                    n += 1;
                    path = with_stem_suffix(&wanted, n);
                }
                taken.insert(path.clone());
                path
            })
            .collect()
    }

    pub fn dub_options(&self) -> DubOptions {
        DubOptions {
            baseline_speedup: self.baseline_speedup,
            ..DubOptions::default()
        }
    }
}

fn with_stem_suffix(path: &Path, n: usize) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}_{}", stem, n),
    };
    path.with_file_name(name)
}

/// Encoder settings passed to ffmpeg.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// `None` keeps the encoder's default rate control.
    pub video_bitrate: Option<String>,
    /// `None` keeps the source resolution.
    pub width: Option<u32>,
}

impl EncodeOptions {
    /// H.264 + AAC 192k, source resolution.
    pub fn final_output() -> Self {
        Self {
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "192k".into(),
            video_bitrate: None,
            width: None,
        }
    }

    /// 480 px wide, 700k video, 96k audio.
    pub fn compressed() -> Self {
        Self {
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "96k".into(),
            video_bitrate: Some("700k".into()),
            width: Some(480),
        }
    }
}

/// Knobs for one dubbing run, independent of the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct DubOptions {
    pub source_language: String,
    pub target_language: String,
    /// First-pass tempo applied to every synthesized clip.
    pub baseline_speedup: f64,
    /// Sample rate of the dubbed audio track.
    pub sample_rate: u32,
    pub encode: EncodeOptions,
    pub compress: EncodeOptions,
}

impl Default for DubOptions {
    fn default() -> Self {
        Self {
            source_language: SOURCE_LANGUAGE.into(),
            target_language: TARGET_LANGUAGE.into(),
            baseline_speedup: 1.10,
            sample_rate: 24_000,
            encode: EncodeOptions::final_output(),
            compress: EncodeOptions::compressed(),
        }
    }
}
