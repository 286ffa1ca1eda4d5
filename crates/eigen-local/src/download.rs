//! Model downloads: one resumable, cancellable job per model id.
//!
//! Files stream into `<file>.partial` next to their final location and are
//! renamed into place only after every file of the model arrived and passed
//! its checksum. An interrupted transfer leaves the partial file behind and
//! the next attempt resumes it with a `Range` request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{expected_paths, installed_paths, is_downloaded, ModelDescriptor, ModelFile};
use crate::error::DownloadError;
use crate::events::{EventBus, RuntimeEvent};
use crate::paths::{model_dir, partial_path};

/// Default minimum spacing of progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
/// Default bound on waiting for the next chunk.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAccepted {
    Started,
    /// A job for this model exists; the request attached to it.
    AlreadyRunning,
    AlreadyDownloaded,
}

/// Snapshot of an active download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadJob {
    pub model_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
}

impl DownloadJob {
    /// Progress from 0 to 100.
    pub fn percent(&self) -> f64 {
        percent(self.bytes_downloaded, self.total_bytes)
    }
}

struct Job {
    cancel: CancellationToken,
    snapshot: DownloadJob,
}

struct Shared {
    models_dir: PathBuf,
    client: reqwest::Client,
    events: EventBus,
    jobs: Mutex<HashMap<String, Job>>,
    progress_interval: Duration,
    idle_timeout: Duration,
}

/// Manager for downloading models in the background.
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    /// Manager writing under `models_dir` with the default timings.
    pub fn new(models_dir: impl Into<PathBuf>, events: EventBus) -> Self {
        Self::with_timings(
            models_dir,
            events,
            DEFAULT_PROGRESS_INTERVAL,
            DEFAULT_IDLE_TIMEOUT,
        )
    }

    /// Manager with a custom progress throttle and idle timeout.
    pub fn with_timings(
        models_dir: impl Into<PathBuf>,
        events: EventBus,
        progress_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            shared: Arc::new(Shared {
                models_dir: models_dir.into(),
                client,
                events,
                jobs: Mutex::new(HashMap::new()),
                progress_interval,
                idle_timeout,
            }),
        }
    }

    /// Directory holding one subdirectory per model.
    pub fn models_dir(&self) -> &Path {
        &self.shared.models_dir
    }

    /// Start downloading `descriptor` unless it is present or already in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, descriptor: &ModelDescriptor) -> DownloadAccepted {
        let mut jobs = self.shared.jobs();
        if jobs.contains_key(&descriptor.id) {
            debug!("Download of {} already running", descriptor.id);
            return DownloadAccepted::AlreadyRunning;
        }
        if is_downloaded(&self.shared.models_dir, descriptor) {
            return DownloadAccepted::AlreadyDownloaded;
        }

        let cancel = CancellationToken::new();
        jobs.insert(
            descriptor.id.clone(),
            Job {
                cancel: cancel.clone(),
                snapshot: DownloadJob {
                    model_id: descriptor.id.clone(),
                    bytes_downloaded: 0,
                    total_bytes: descriptor.files.total_bytes(),
                    speed_bps: 0,
                },
            },
        );
        drop(jobs);

        info!("Downloading model '{}'", descriptor.id);
        let shared = self.shared.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move { shared.run(descriptor, cancel).await });
        DownloadAccepted::Started
    }

    /// Signal the job for `model_id`. Returns false if there is none.
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.shared.jobs().get(model_id) {
            Some(job) => {
                info!("Cancelling download of {}", model_id);
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running download.
    pub fn cancel_all(&self) {
        for job in self.shared.jobs().values() {
            job.cancel.cancel();
        }
    }

    /// Progress of the download of `model_id`, if one is running.
    pub fn job(&self, model_id: &str) -> Option<DownloadJob> {
        self.shared
            .jobs()
            .get(model_id)
            .map(|job| job.snapshot.clone())
    }

    /// True while a job for `model_id` exists.
    pub fn is_downloading(&self, model_id: &str) -> bool {
        self.shared.jobs().contains_key(model_id)
    }

    /// Snapshots of every running download.
    pub fn active_jobs(&self) -> Vec<DownloadJob> {
        self.shared
            .jobs()
            .values()
            .map(|job| job.snapshot.clone())
            .collect()
    }
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, descriptor: ModelDescriptor, cancel: CancellationToken) {
        let model_id = descriptor.id.clone();
        let result = self.transfer(&descriptor, &cancel).await;

        if matches!(result, Err(DownloadError::Cancelled)) {
            self.discard(&model_id).await;
        }
        // The job disappears before its terminal event.
        self.jobs().remove(&model_id);

        let event = match result {
            Ok(()) => {
                info!("Model '{}' downloaded successfully", model_id);
                RuntimeEvent::DownloadComplete { model_id }
            }
            Err(DownloadError::Cancelled) => {
                info!("Download of '{}' cancelled", model_id);
                RuntimeEvent::DownloadCancelled { model_id }
            }
            Err(e) => {
                error!("Download of '{}' failed: {}", model_id, e);
                RuntimeEvent::DownloadError {
                    model_id,
                    message: e.to_string(),
                }
            }
        };
        self.events.publish(event);
    }

    async fn transfer(
        &self,
        descriptor: &ModelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let dir = model_dir(&self.models_dir, &descriptor.id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut progress = Progress::new(self, &descriptor.id, descriptor.files.total_bytes());
        let mut finished = Vec::new();

        for file in descriptor.files.iter() {
            let target = dir.join(&file.filename);
            if let Ok(metadata) = tokio::fs::metadata(&target).await {
                // e.g. a projector kept from an earlier attempt
                progress.complete_file(metadata.len());
                continue;
            }

            let partial = partial_path(&target);
            let len = self.fetch(file, &partial, cancel, &mut progress).await?;
            progress.complete_file(len);

            if let Some(expected) = &file.sha256 {
                if let Err(e) = verify_checksum(&partial, expected, &file.filename).await {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e);
                }
                debug!("Checksum verified for {}", file.filename);
            }
            finished.push((partial, target));
        }

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        for (partial, target) in finished {
            tokio::fs::rename(&partial, &target).await?;
        }
        progress.finish();
        Ok(())
    }

    /// Stream one file into `partial`, resuming it if present.
    async fn fetch(
        &self,
        file: &ModelFile,
        partial: &Path,
        cancel: &CancellationToken,
        progress: &mut Progress<'_>,
    ) -> Result<u64, DownloadError> {
        let resume_from = tokio::fs::metadata(partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.client.get(&file.url);
        if resume_from > 0 {
            debug!("Resuming {} from byte {}", file.filename, resume_from);
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let (mut written, output) = if resume_from > 0 && status == StatusCode::PARTIAL_CONTENT {
            let output = tokio::fs::OpenOptions::new()
                .append(true)
                .open(partial)
                .await?;
            (resume_from, output)
        } else if resume_from > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // The partial file already holds the whole body.
            progress.update(resume_from);
            return Ok(resume_from);
        } else if status.is_success() {
            if resume_from > 0 {
                warn!("Server ignored range request for {}, restarting", file.filename);
            }
            (0, tokio::fs::File::create(partial).await?)
        } else {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: file.url.clone(),
            });
        };
        progress.update(written);

        let mut output = BufWriter::new(output);
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = timeout(self.idle_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    output.flush().await?;
                    return Err(DownloadError::Stalled(self.idle_timeout));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    output.flush().await?;
                    return Err(DownloadError::Transport(e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            output.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.update(written);
        }
        output.flush().await?;
        Ok(written)
    }

    /// Remove everything a cancelled job left behind.
    async fn discard(&self, model_id: &str) {
        let dir = model_dir(&self.models_dir, model_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean up {}: {}", dir.display(), e);
            }
        }
    }
}

/// Throttled progress reporting for one job.
struct Progress<'a> {
    shared: &'a Shared,
    model_id: &'a str,
    total: u64,
    /// Bytes of files already finished.
    completed: u64,
    bytes: u64,
    baseline: Option<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl<'a> Progress<'a> {
    fn new(shared: &'a Shared, model_id: &'a str, total: u64) -> Self {
        Self {
            shared,
            model_id,
            total,
            completed: 0,
            bytes: 0,
            baseline: None,
            last_emit: None,
        }
    }

    /// Record `current_file` bytes of the file in flight.
    fn update(&mut self, current_file: u64) {
        self.bytes = self.bytes.max(self.completed + current_file);
        let now = Instant::now();
        let (started, base) = *self.baseline.get_or_insert((now, self.bytes));
        let elapsed = now.duration_since(started).as_secs_f64();
        let speed = if elapsed > 0.0 {
            ((self.bytes - base) as f64 / elapsed) as u64
        } else {
            0
        };

        if let Some(job) = self.shared.jobs().get_mut(self.model_id) {
            job.snapshot.bytes_downloaded = self.bytes;
            job.snapshot.total_bytes = self.total.max(self.bytes);
            job.snapshot.speed_bps = speed;
        }

        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.shared.progress_interval);
        if due {
            self.last_emit = Some(now);
            self.emit(speed);
        }
    }

    fn complete_file(&mut self, len: u64) {
        self.completed += len;
        self.bytes = self.bytes.max(self.completed);
    }

    /// Final event, sent regardless of throttling.
    fn finish(&mut self) {
        let speed = self
            .shared
            .jobs()
            .get(self.model_id)
            .map_or(0, |job| job.snapshot.speed_bps);
        self.emit(speed);
    }

    fn emit(&self, speed_bps: u64) {
        let total_bytes = self.total.max(self.bytes);
        self.shared.events.publish(RuntimeEvent::DownloadProgress {
            model_id: self.model_id.to_string(),
            bytes_downloaded: self.bytes,
            total_bytes,
            percent: percent(self.bytes, total_bytes),
            speed_bps,
        });
    }
}

fn percent(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (bytes as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// SHA-256 of a file as lowercase hex.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024]; // 1MB buffer

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn verify_checksum(path: &Path, expected: &str, name: &str) -> Result<(), DownloadError> {
    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            file: name.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// True if every file of `descriptor` is present and matches its checksum.
pub async fn verify_installed(
    models_dir: &Path,
    descriptor: &ModelDescriptor,
) -> Result<bool, DownloadError> {
    if installed_paths(models_dir, descriptor).is_none() {
        return Ok(false);
    }
    let paths = expected_paths(models_dir, descriptor);
    let files = std::iter::once((&descriptor.files.model, &paths.model)).chain(
        descriptor
            .files
            .mmproj
            .as_ref()
            .zip(paths.mmproj.as_ref()),
    );
    for (file, path) in files {
        if let Some(expected) = &file.sha256 {
            if let Err(e) = verify_checksum(path, expected, &file.filename).await {
                warn!("{}", e);
                return Ok(false);
            }
        }
    }
    Ok(true)
}
