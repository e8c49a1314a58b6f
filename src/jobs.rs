//! Download jobs: admission, engine invocation, progress publication and the
//! final history append.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Local;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RuntimeSettings,
    engine::{Engine, EngineError, FailureKind, FetchRequest, TransferEvent},
    history::{DownloadRecord, HistoryError, HistoryStore},
    progress::{ProgressSnapshot, ProgressTable},
};

pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
pub const MERGE_FORMAT: &str = "mp4";
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Engine format selector for an optional user choice.
pub fn format_selector(format_id: Option<&str>) -> String {
    match format_id.map(str::trim) {
        None | Some("") | Some("best") => "bestvideo+bestaudio/best".to_string(),
        Some(id) => format!("{id}+bestaudio/best"),
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub download_dir: PathBuf,
    pub max_jobs: usize,
    /// Pause between the engine finishing and measuring the file.
    pub settle_delay: Duration,
}

impl From<&RuntimeSettings> for JobSettings {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            download_dir: settings.download_dir.clone(),
            max_jobs: settings.max_jobs,
            settle_delay: settings.settle_delay,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a download for {0} is already running")]
    AlreadyActive(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("downloaded file {} is missing: {source}", .path.display())]
    MissingOutput { path: PathBuf, source: io::Error },
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("download task aborted: {0}")]
    Aborted(String),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Engine(err) => err.kind(),
            Self::MissingOutput { .. } => FailureKind::MissingOutput,
            Self::AlreadyActive(_) | Self::History(_) | Self::Aborted(_) => FailureKind::Internal,
        }
    }
}

struct ActiveJob {
    url: String,
    cancel: CancellationToken,
}

struct RunnerInner {
    engine: Arc<dyn Engine>,
    history: Arc<HistoryStore>,
    progress: Arc<ProgressTable>,
    settings: JobSettings,
    permits: Semaphore,
    active: Mutex<HashMap<String, ActiveJob>>,
    counter: AtomicU64,
}

/// Starts and tracks download jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(
        engine: Arc<dyn Engine>,
        history: Arc<HistoryStore>,
        progress: Arc<ProgressTable>,
        settings: JobSettings,
    ) -> Self {
        let permits = Semaphore::new(settings.max_jobs.max(1));
        Self {
            inner: Arc::new(RunnerInner {
                engine,
                history,
                progress,
                settings,
                permits,
                active: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a job for `url` and spawns it. The job shows `queued` until
    /// an engine slot frees up.
    pub fn start(&self, url: &str, format_id: Option<&str>) -> Result<JobHandle, JobError> {
        let cancel = CancellationToken::new();
        let job_id = {
            let mut active = self.inner.active.lock();
            if active.values().any(|job| job.url == url) {
                return Err(JobError::AlreadyActive(url.to_string()));
            }
            let job_id = format!("job-{}", self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1);
            active.insert(
                job_id.clone(),
                ActiveJob {
                    url: url.to_string(),
                    cancel: cancel.clone(),
                },
            );
            job_id
        };

        self.inner
            .progress
            .record(&job_id, ProgressSnapshot::queued().with_job(&job_id));

        let request = FetchRequest {
            url: url.to_string(),
            format_selector: format_selector(format_id),
            output_template: self.inner.settings.download_dir.join(OUTPUT_TEMPLATE),
            merge_format: MERGE_FORMAT.to_string(),
        };
        info!(%job_id, url, format = %request.format_selector, "download queued");

        let task = tokio::spawn(Arc::clone(&self.inner).run(
            job_id.clone(),
            request,
            cancel.clone(),
        ));
        Ok(JobHandle {
            job_id,
            cancel,
            task,
        })
    }

    /// Cancels an active job. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.active.lock().get(job_id) {
            Some(job) => {
                job.cancel.cancel();
                info!(job_id, url = %job.url, "download cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }
}

impl RunnerInner {
    async fn run(
        self: Arc<Self>,
        job_id: String,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadRecord, JobError> {
        let tracker = JobProgress::new(job_id.clone(), Arc::clone(&self.progress));
        let result = self.execute(&tracker, &request, &cancel).await;

        match &result {
            Ok(record) => {
                info!(%job_id, id = %record.id, file = %record.filename, size = record.filesize, "download finished");
                tracker.publish(ProgressSnapshot::finished(record.filesize));
            }
            Err(err) => {
                warn!(%job_id, url = %request.url, kind = ?err.kind(), error = %err, "download failed");
                tracker.publish(ProgressSnapshot::failed(err.kind(), err.to_string()));
            }
        }
        self.active.lock().remove(&job_id);
        result
    }

    async fn execute(
        &self,
        tracker: &JobProgress,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadRecord, JobError> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
            permit = self.permits.acquire() => {
                permit.map_err(|err| JobError::Aborted(err.to_string()))?
            }
        };
        debug!(job_id = %tracker.job_id, "engine slot acquired");

        let sink = |event: TransferEvent| tracker.observe(event);
        let outcome = self.engine.fetch(request, &sink, cancel).await?;
        tracker.bind_video(&outcome.id);

        tokio::select! {
            _ = cancel.cancelled() => {
                // Cancelled after the file landed: drop it, it will never be recorded.
                if let Err(err) = tokio::fs::remove_file(&outcome.final_path).await
                    && err.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = %outcome.final_path.display(), error = %err, "could not remove cancelled download");
                }
                return Err(EngineError::Cancelled.into());
            }
            _ = tokio::time::sleep(self.settings.settle_delay) => {}
        }

        let metadata = tokio::fs::metadata(&outcome.final_path)
            .await
            .map_err(|source| JobError::MissingOutput {
                path: outcome.final_path.clone(),
                source,
            })?;
        let filename = outcome
            .final_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                EngineError::Extraction(format!(
                    "output path {} has no file name",
                    outcome.final_path.display()
                ))
            })?;

        let record = DownloadRecord {
            id: outcome.id,
            title: outcome.title,
            duration: outcome.duration,
            uploader: outcome.uploader,
            description: outcome.description,
            filename,
            thumbnail_url: outcome.thumbnail,
            download_date: Local::now().format(DATE_FORMAT).to_string(),
            filesize: metadata.len(),
            url: request.url.clone(),
        };

        let history = Arc::clone(&self.history);
        let stored = record.clone();
        tokio::task::spawn_blocking(move || history.append(stored))
            .await
            .map_err(|err| JobError::Aborted(err.to_string()))??;
        Ok(record)
    }
}

/// Publishes snapshots under the job id and, once the engine has named it,
/// the video id as well.
struct JobProgress {
    job_id: String,
    video_id: Mutex<Option<String>>,
    table: Arc<ProgressTable>,
}

impl JobProgress {
    fn new(job_id: String, table: Arc<ProgressTable>) -> Self {
        Self {
            job_id,
            video_id: Mutex::new(None),
            table,
        }
    }

    fn bind_video(&self, video_id: &str) {
        *self.video_id.lock() = Some(video_id.to_string());
    }

    fn observe(&self, event: TransferEvent) {
        let (video_id, snapshot) = match event {
            TransferEvent::Downloading {
                video_id,
                downloaded_bytes,
                total_bytes,
                speed,
                eta,
            } => (
                video_id,
                ProgressSnapshot::downloading(downloaded_bytes, total_bytes, speed, eta),
            ),
            TransferEvent::Finished { video_id } => (video_id, ProgressSnapshot::merging()),
        };
        self.bind_video(&video_id);
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        let snapshot = snapshot.with_job(&self.job_id);
        let video_id = self.video_id.lock().clone();
        if let Some(video_id) = video_id
            && video_id != self.job_id
        {
            self.table.record(&video_id, snapshot.clone());
        }
        self.table.record(&self.job_id, snapshot);
    }
}

/// A spawned job. Dropping the handle detaches the job; it keeps running.
pub struct JobHandle {
    job_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<DownloadRecord, JobError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the job reached a terminal state.
    pub async fn wait(self) -> Result<DownloadRecord, JobError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(JobError::Aborted(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::testing::{FetchPlan, ScriptedEngine},
        history::SortOrder,
        progress::{ProgressReport, ProgressStatus},
    };
    use std::path::Path;
    use tempfile::tempdir;

    struct Fixture {
        runner: JobRunner,
        engine: Arc<ScriptedEngine>,
        history: Arc<HistoryStore>,
        progress: Arc<ProgressTable>,
    }

    fn fixture(dir: &Path, plan: FetchPlan, max_jobs: usize) -> Fixture {
        fixture_with_settle(dir, plan, max_jobs, Duration::ZERO)
    }

    fn fixture_with_settle(
        dir: &Path,
        plan: FetchPlan,
        max_jobs: usize,
        settle_delay: Duration,
    ) -> Fixture {
        let engine = Arc::new(ScriptedEngine::new(plan));
        let history = Arc::new(HistoryStore::new(dir.join("history.json")));
        let progress = Arc::new(ProgressTable::new(Duration::from_secs(60)));
        let runner = JobRunner::new(
            engine.clone(),
            history.clone(),
            progress.clone(),
            JobSettings {
                download_dir: dir.to_path_buf(),
                max_jobs,
                settle_delay,
            },
        );
        Fixture {
            runner,
            engine,
            history,
            progress,
        }
    }

    fn snapshot(progress: &ProgressTable, key: &str) -> ProgressSnapshot {
        match progress.get(key) {
            ProgressReport::Known(snapshot) => snapshot,
            ProgressReport::Missing(_) => panic!("no progress for {key}"),
        }
    }

    async fn wait_for_status(progress: &ProgressTable, key: &str, status: ProgressStatus) {
        for _ in 0..500 {
            if progress.get(key).status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} never reached {status:?}");
    }

    #[test]
    fn selector_defaults_to_best_pair() {
        assert_eq!(format_selector(None), "bestvideo+bestaudio/best");
        assert_eq!(format_selector(Some("best")), "bestvideo+bestaudio/best");
        assert_eq!(format_selector(Some("")), "bestvideo+bestaudio/best");
        assert_eq!(format_selector(Some("137")), "137+bestaudio/best");
        assert_eq!(
            format_selector(Some("best[height<=720]")),
            "best[height<=720]+bestaudio/best"
        );
    }

    #[tokio::test]
    async fn completed_job_records_on_disk_size() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            dir.path(),
            FetchPlan::Succeed {
                bytes: 3000,
                reported_total: 9999,
            },
            2,
        );

        let handle = fx.runner.start("https://example.com/watch/abc", None).unwrap();
        let job_id = handle.job_id().to_string();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.id, "abc");
        assert_eq!(record.filename, "abc.mp4");
        assert_eq!(record.filesize, 3000);
        assert_eq!(record.url, "https://example.com/watch/abc");
        assert_eq!(record.thumbnail_url.as_deref(), Some("https://img.example/thumb.jpg"));
        assert_eq!(record.download_date.len(), "2024-01-01T00:00:00.000000".len());

        let stored = fx.history.load(None, SortOrder::Desc).unwrap();
        assert_eq!(stored, vec![record]);

        for key in [job_id.as_str(), "abc"] {
            let done = snapshot(&fx.progress, key);
            assert_eq!(done.status, ProgressStatus::Finished);
            assert_eq!(done.percent, 100.0);
            assert_eq!(done.total_bytes, 3000);
            assert_eq!(done.job_id.as_deref(), Some(job_id.as_str()));
        }

        let requests = fx.engine.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].format_selector, "bestvideo+bestaudio/best");
        assert_eq!(requests[0].output_template, dir.path().join(OUTPUT_TEMPLATE));
        assert_eq!(requests[0].merge_format, "mp4");
        assert_eq!(fx.runner.active_count(), 0);
    }

    #[tokio::test]
    async fn engine_failure_publishes_failed_and_skips_history() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            dir.path(),
            FetchPlan::Fail(|| EngineError::NotFound("Video unavailable".into())),
            1,
        );

        let handle = fx.runner.start("https://example.com/gone", Some("22")).unwrap();
        let job_id = handle.job_id().to_string();
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NotFound);

        let failed = snapshot(&fx.progress, &job_id);
        assert_eq!(failed.status, ProgressStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, FailureKind::NotFound);
        assert!(fx.history.load(None, SortOrder::Desc).unwrap().is_empty());
        assert_eq!(fx.engine.requests.lock()[0].format_selector, "22+bestaudio/best");
    }

    #[tokio::test]
    async fn missing_output_is_reported() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), FetchPlan::NoFile, 1);

        let handle = fx.runner.start("https://example.com/ghost", None).unwrap();
        let job_id = handle.job_id().to_string();
        let err = handle.wait().await.unwrap_err();

        assert!(matches!(err, JobError::MissingOutput { .. }));
        let failed = snapshot(&fx.progress, &job_id);
        assert_eq!(failed.error.unwrap().kind, FailureKind::MissingOutput);
        assert_eq!(snapshot(&fx.progress, "ghost").status, ProgressStatus::Failed);
        assert!(fx.history.load(None, SortOrder::Desc).unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_url_is_rejected_until_cancelled() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), FetchPlan::Hang, 2);
        let url = "https://example.com/slow";

        let handle = fx.runner.start(url, None).unwrap();
        let job_id = handle.job_id().to_string();
        assert!(matches!(
            fx.runner.start(url, None),
            Err(JobError::AlreadyActive(_))
        ));

        wait_for_status(&fx.progress, &job_id, ProgressStatus::Downloading).await;
        assert!(fx.runner.cancel(&job_id));
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Cancelled);

        let cancelled = snapshot(&fx.progress, &job_id);
        assert_eq!(cancelled.status, ProgressStatus::Failed);
        assert_eq!(cancelled.error.unwrap().kind, FailureKind::Cancelled);
        assert!(!fx.runner.cancel(&job_id));
        assert_eq!(fx.runner.active_count(), 0);

        let again = fx.runner.start(url, None).unwrap();
        assert_ne!(again.job_id(), job_id);
        again.cancel();
        assert!(again.wait().await.is_err());
    }

    #[tokio::test]
    async fn cancel_while_settling_discards_the_file() {
        let dir = tempdir().unwrap();
        let fx = fixture_with_settle(
            dir.path(),
            FetchPlan::Succeed {
                bytes: 64,
                reported_total: 64,
            },
            1,
            Duration::from_secs(30),
        );

        let handle = fx.runner.start("https://example.com/watch/late", None).unwrap();
        let job_id = handle.job_id().to_string();
        wait_for_status(&fx.progress, &job_id, ProgressStatus::Merging).await;
        assert!(dir.path().join("late.mp4").exists());

        assert!(fx.runner.cancel(&job_id));
        assert_eq!(handle.wait().await.unwrap_err().kind(), FailureKind::Cancelled);
        assert!(!dir.path().join("late.mp4").exists());
        assert!(fx.history.load(None, SortOrder::Desc).unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_wait_for_a_free_slot() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), FetchPlan::Hang, 1);

        let first = fx.runner.start("https://example.com/one", None).unwrap();
        let second = fx.runner.start("https://example.com/two", None).unwrap();
        let second_id = second.job_id().to_string();

        wait_for_status(&fx.progress, first.job_id(), ProgressStatus::Downloading).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.progress.get(&second_id).status(), ProgressStatus::Queued);
        assert_eq!(fx.engine.requests.lock().len(), 1);

        first.cancel();
        assert!(first.wait().await.is_err());
        wait_for_status(&fx.progress, &second_id, ProgressStatus::Downloading).await;
        assert_eq!(fx.engine.requests.lock().len(), 2);

        second.cancel();
        assert!(second.wait().await.is_err());
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_never_reaches_the_engine() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), FetchPlan::Hang, 1);

        let first = fx.runner.start("https://example.com/one", None).unwrap();
        wait_for_status(&fx.progress, first.job_id(), ProgressStatus::Downloading).await;
        let queued = fx.runner.start("https://example.com/two", None).unwrap();
        let queued_id = queued.job_id().to_string();

        assert!(fx.runner.cancel(&queued_id));
        assert_eq!(queued.wait().await.unwrap_err().kind(), FailureKind::Cancelled);
        assert_eq!(fx.engine.requests.lock().len(), 1);

        first.cancel();
        assert!(first.wait().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_all_land_in_history() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            dir.path(),
            FetchPlan::Succeed {
                bytes: 128,
                reported_total: 128,
            },
            3,
        );

        let handles: Vec<JobHandle> = (0..8)
            .map(|n| {
                fx.runner
                    .start(&format!("https://example.com/v/clip{n}"), None)
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let stored = fx.history.load(None, SortOrder::Desc).unwrap();
        assert_eq!(stored.len(), 8);
        assert!(stored.iter().all(|record| record.filesize == 128));
    }
}
