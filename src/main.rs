use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autodub::{
    audio::is_video_file,
    config::{Config, LlmProvider},
    cleanup_orphaned_temp_files, DubJob, Dubber, Ffmpeg, GoogleSpeech, LlmTranslator,
    ProgressSink, Services, WhisperModel, WhisperTranscriber, WorkerPool,
};

fn main() -> ExitCode {
    let config = Config::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Clean up any orphaned temp scopes from previous runs that were killed
    cleanup_orphaned_temp_files();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every job succeeded.
async fn run(config: Config) -> Result<bool> {
    for input in &config.inputs {
        if !input.exists() {
            anyhow::bail!("Input file does not exist: {}", input.display());
        }
        if !is_video_file(input) {
            warn!("{} does not look like a video file", input.display());
        }
    }

    let services = build_services(&config).await?;
    let dubber = Arc::new(Dubber::new(services, config.dub_options()));
    let (pool, mut outcomes) = WorkerPool::new(dubber, config.jobs, config.max_size_bytes());

    let bars = MultiProgress::new();
    let outputs = config.job_outputs();
    for (id, (input, output)) in config.inputs.iter().zip(outputs).enumerate() {
        if output != config.output_path(input) {
            warn!(
                "{} would overwrite another file, writing {} instead",
                input.display(),
                output.display()
            );
        }
        let job = DubJob {
            id,
            input: input.clone(),
            subtitles: config.subtitles.then(|| output.with_extension("srt")),
            output,
        };
        let name = input
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        let progress = JobSpinner::new(&bars, name);
        pool.submit(job, Arc::new(progress));
    }
    drop(pool);

    let mut failures = 0;
    while let Some(outcome) = outcomes.recv().await {
        match outcome.result {
            Ok(delivered) => {
                info!(
                    "{} -> {} ({:.1} MiB, {} segments)",
                    outcome.job.input.display(),
                    delivered.path.display(),
                    delivered.size_bytes as f64 / (1024.0 * 1024.0),
                    delivered.segments
                );
                if let Some(srt) = delivered.subtitles {
                    info!("Subtitles: {}", srt.display());
                }
            }
            Err(e) => {
                failures += 1;
                if e.is_external() {
                    warn!("{}: {}", outcome.job.input.display(), e);
                } else {
                    error!("{}: {}", outcome.job.input.display(), e);
                }
            }
        }
    }

    if failures > 0 {
        error!("{} of {} videos failed", failures, config.inputs.len());
    } else {
        info!("Done!");
    }
    Ok(failures == 0)
}

async fn build_services(config: &Config) -> Result<Services> {
    let api_key = match (&config.llm_api_key, config.llm_provider) {
        (Some(key), _) => key.clone(),
        // local servers do not authenticate
        (None, LlmProvider::Ollama) => String::new(),
        (None, _) => anyhow::bail!(
            "LLM API key required for translation. Set --llm-api-key or AUTODUB_LLM_API_KEY"
        ),
    };
    let runtime = Handle::current();
    let translator = LlmTranslator::new(
        config.llm_provider,
        &api_key,
        &config.llm_model,
        config.llm_url.as_deref(),
        runtime.clone(),
    )?;

    let device = config.device.to_candle_device()?;
    let model_size = config.model;
    let cache_dir = config.cache_dir();
    let language = config.dub_options().source_language;
    // model download and load are blocking
    let model = tokio::task::spawn_blocking(move || {
        WhisperModel::load(model_size, &cache_dir, device, &language)
    })
    .await
    .context("Whisper loader panicked")??;

    Ok(Services {
        transcriber: Arc::new(WhisperTranscriber::new(model)),
        translator: Arc::new(translator),
        synthesizer: Arc::new(GoogleSpeech::new(runtime)),
        media: Arc::new(Ffmpeg::default()),
    })
}

/// Spinner showing the latest status line of one job.
struct JobSpinner {
    bar: ProgressBar,
    name: String,
}

impl JobSpinner {
    fn new(bars: &MultiProgress, name: String) -> Self {
        let bar = bars.add(ProgressBar::new_spinner());
        let style = ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {prefix}: {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(name.clone());
        bar.set_message("queued");
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar, name }
    }
}

impl ProgressSink for JobSpinner {
    fn report(&self, message: &str) {
        for line in message.lines().filter(|l| !l.trim().is_empty()) {
            self.bar.println(format!("[{}] {}", self.name, line));
        }
        if let Some(last) = message.lines().rev().find(|l| !l.trim().is_empty()) {
            self.bar.set_message(last.to_string());
        }
    }
}

impl Drop for JobSpinner {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
