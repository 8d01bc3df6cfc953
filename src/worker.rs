//! Bounded pool of dubbing jobs.
//!
//! Each job runs on a blocking thread with its own [`TempScope`]. A semaphore
//! caps how many run at once and finished jobs are reported on a channel in
//! completion order.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, info_span};

use crate::error::{DubError, DubResult};
use crate::pipeline::{Dubber, ProgressSink};
use crate::temp::TempScope;

#[derive(Debug, Clone, PartialEq)]
pub struct DubJob {
    pub id: usize,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Write translated subtitles here as well.
    pub subtitles: Option<PathBuf>,
}

/// What a successful job left on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub subtitles: Option<PathBuf>,
    pub segments: usize,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: DubJob,
    pub result: DubResult<Delivered>,
}

pub struct WorkerPool {
    dubber: Arc<Dubber>,
    permits: Arc<Semaphore>,
    size_limit: u64,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
}

impl WorkerPool {
    /// The receiver yields one outcome per submitted job and closes once the
    /// pool and every job it started are gone.
    pub fn new(
        dubber: Arc<Dubber>,
        max_workers: usize,
        size_limit: u64,
    ) -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let (outcomes, rx) = mpsc::unbounded_channel();
        let pool = Self {
            dubber,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            size_limit,
            outcomes,
        };
        (pool, rx)
    }

    /// Queue a job. It starts as soon as a worker is free.
    pub fn submit(&self, job: DubJob, progress: Arc<dyn ProgressSink>) -> JoinHandle<()> {
        let dubber = self.dubber.clone();
        let permits = self.permits.clone();
        let outcomes = self.outcomes.clone();
        let size_limit = self.size_limit;

        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(permit) => {
                    let job = job.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        let _span = info_span!("job", id = job.id).entered();
                        run_job(&dubber, &job, size_limit, progress.as_ref())
                    });
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(DubError::Worker(e.to_string())),
                    }
                }
                Err(e) => Err(DubError::Worker(e.to_string())),
            };
            // the receiver may already be gone during shutdown
            let _ = outcomes.send(JobOutcome { job, result });
        })
    }
}

fn run_job(
    dubber: &Dubber,
    job: &DubJob,
    size_limit: u64,
    progress: &dyn ProgressSink,
) -> DubResult<Delivered> {
    info!("Dubbing {}", job.input.display());
    let scope = TempScope::new()?;
    let dubbed = dubber.dub(&job.input, &scope, progress)?;
    let artifact = dubber
        .governor(size_limit)
        .ensure_under_limit(dubbed.artifact, &scope, progress)?;

    // Everything is written inside the scope first; nothing reaches the
    // destination unless both files do.
    let subtitles = match &job.subtitles {
        Some(dest) => {
            let staged = scope.file(".srt");
            dubbed.subtitles.to_file(&staged)?;
            scope.persist(&staged, dest)?;
            Some(dest)
        }
        None => None,
    };
    if let Err(e) = scope.persist(&artifact.path, &job.output) {
        if let Some(dest) = subtitles {
            let _ = std::fs::remove_file(dest);
        }
        return Err(e.into());
    }
    info!(
        "Wrote {} ({} bytes)",
        job.output.display(),
        artifact.size_bytes
    );

    Ok(Delivered {
        path: job.output.clone(),
        size_bytes: artifact.size_bytes,
        subtitles: job.subtitles.clone(),
        segments: dubbed.segments,
    })
}
