//! Download job coordinator.
//!
//! One call to [`DownloadCoordinator::submit`] walks a request through the
//! whole lifecycle: entitlement, URL validation, metadata resolution, format
//! selection, stream fetch plus transcode inside a private scratch scope,
//! staging, and finally accounting. Failures at any step leave no scratch
//! files behind and never touch the ledger.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    account::{AccountError, QuotaLedger},
    media::{
        StreamSelection, VideoMetadata, download_file_name, parse_source_url, select_streams,
    },
    quality::{Quality, Resolution},
    resolver::MetadataResolver,
    retrieval::{ArtifactStatus, RetrievalStore},
    security::is_token_shaped,
    session::SessionRegistry,
    transcode::{DEFAULT_AUDIO_BITRATE_KBPS, TranscodeTarget, Transcoder},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    InvalidSource(String),
    #[error("Could not fetch video info: {0}")]
    SourceUnresolvable(String),
    #[error("No suitable format found: {0}")]
    NoSuitableFormat(String),
    #[error("Free download limit reached")]
    QuotaExceeded,
    #[error("{0} downloads require a premium account")]
    PremiumRequired(Resolution),
    #[error("Transcoding failed: {0}")]
    TranscodeFailed(String),
    #[error("Job not found")]
    NotFound,
    #[error("Server error: {0}")]
    Internal(String),
}

impl DownloadError {
    pub fn invalid_url() -> Self {
        Self::InvalidSource("Invalid YouTube URL format".to_owned())
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Requested,
    Resolving,
    FormatSelected,
    Transcoding,
    Staged,
    Served,
    Failed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub resolve_timeout: Duration,
    pub transcode_timeout: Duration,
    pub audio_bitrate_kbps: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(60),
            transcode_timeout: Duration::from_secs(900),
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct StagedDownload {
    pub job_id: String,
    pub handle: String,
    pub file_name: String,
    pub download_count: u32,
}

impl StagedDownload {
    pub fn download_url(&self) -> String {
        format!("/api/download-file/{}/{}", self.handle, self.file_name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub quality: String,
    pub message: String,
}

#[derive(Debug, Clone)]
struct DownloadJob {
    id: String,
    account_id: String,
    source_url: String,
    quality: Quality,
    state: JobState,
    message: String,
    handle: Option<String>,
    /// Set once the job reaches `Staged` or `Failed`.
    finished_at: Option<SystemTime>,
}

impl DownloadJob {
    /// Finished jobs are prunable once their artifact is no longer waiting
    /// to be fetched.
    fn is_prunable(&self, retrieval: &RetrievalStore) -> bool {
        match (self.state, self.handle.as_deref()) {
            (JobState::Failed, _) => true,
            (JobState::Staged, Some(handle)) => {
                retrieval.status(handle) != Some(ArtifactStatus::Staged)
            }
            _ => false,
        }
    }
}

fn entitlement_error(err: AccountError) -> DownloadError {
    match err {
        AccountError::NotFound => DownloadError::Unauthorized,
        other => DownloadError::internal(other),
    }
}

/// Marks a job failed when its submission is dropped mid-flight.
struct JobGuard {
    coordinator: DownloadCoordinator,
    job_id: String,
    armed: bool,
}

impl JobGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(job = %self.job_id, "download job cancelled");
        self.coordinator.update_job(&self.job_id, |job| {
            if job.finished_at.is_none() {
                job.state = JobState::Failed;
                job.message = "cancelled".to_owned();
                job.finished_at = Some(SystemTime::now());
            }
        });
    }
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    ledger: QuotaLedger,
    resolver: Arc<dyn MetadataResolver>,
    transcoder: Arc<dyn Transcoder>,
    retrieval: Arc<RetrievalStore>,
    jobs: Mutex<HashMap<String, DownloadJob>>,
    counter: AtomicUsize,
    settings: CoordinatorSettings,
}

impl DownloadCoordinator {
    pub fn new(
        ledger: QuotaLedger,
        resolver: Arc<dyn MetadataResolver>,
        transcoder: Arc<dyn Transcoder>,
        retrieval: Arc<RetrievalStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                ledger,
                resolver,
                transcoder,
                retrieval,
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(1),
                settings,
            }),
        }
    }

    /// Metadata lookup without any entitlement check. The URL is validated
    /// before the resolver is consulted.
    pub async fn video_info(&self, raw_url: &str) -> Result<VideoMetadata, DownloadError> {
        let source = parse_source_url(raw_url).ok_or_else(DownloadError::invalid_url)?;
        self.resolve(&source.canonical()).await
    }

    pub async fn submit(
        &self,
        account_id: &str,
        raw_url: &str,
        quality: Quality,
    ) -> Result<StagedDownload, DownloadError> {
        let ledger = &self.inner.ledger;
        if !ledger
            .can_download(account_id)
            .await
            .map_err(entitlement_error)?
        {
            info!(account = %account_id, "download refused: free limit reached");
            return Err(DownloadError::QuotaExceeded);
        }
        if !quality.container.is_audio_only() && quality.resolution.is_premium_only() {
            let account = ledger
                .account(account_id)
                .await
                .map_err(entitlement_error)?;
            if !account.is_premium() {
                return Err(DownloadError::PremiumRequired(quality.resolution));
            }
        }
        let source = parse_source_url(raw_url).ok_or_else(DownloadError::invalid_url)?;

        let job_id = self.create_job(account_id, source.canonical(), quality);
        let guard = JobGuard {
            coordinator: self.clone(),
            job_id: job_id.clone(),
            armed: true,
        };
        info!(job = %job_id, account = %account_id, %quality, video = %source.video_id, "download job started");

        let outcome = self.run(&job_id, account_id, &source.canonical(), quality).await;
        guard.disarm();
        match outcome {
            Ok(staged) => {
                info!(job = %job_id, file = %staged.file_name, "download job staged");
                Ok(staged)
            }
            Err(err) => {
                warn!(job = %job_id, "download job failed: {err}");
                self.update_job(&job_id, |job| {
                    job.state = JobState::Failed;
                    job.message = err.to_string();
                    job.finished_at = Some(SystemTime::now());
                });
                Err(err)
            }
        }
    }

    /// Forgets finished jobs older than the retrieval stale threshold whose
    /// artifact is gone. Returns how many were removed.
    pub fn prune_jobs_at(&self, now: SystemTime) -> usize {
        let retrieval = &self.inner.retrieval;
        let stale_after = retrieval.stale_after();
        let mut jobs = self.inner.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let old = job
                .finished_at
                .is_some_and(|at| now.duration_since(at).unwrap_or_default() > stale_after);
            !(old && job.is_prunable(retrieval))
        });
        before - jobs.len()
    }

    /// Background task: every `interval`, sweep stale scratch scopes, prune
    /// finished jobs and drop expired sessions until `cancel` fires.
    pub fn spawn_reaper(
        &self,
        sessions: Arc<SessionRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let store = coordinator.inner.retrieval.clone();
                let swept = tokio::task::spawn_blocking(move || store.sweep_at(SystemTime::now()))
                    .await
                    .unwrap_or_else(|err| {
                        warn!("sweep task failed: {err}");
                        0
                    });
                let pruned = coordinator.prune_jobs_at(SystemTime::now());
                let expired = sessions.purge_expired(Utc::now());
                if swept > 0 || pruned > 0 || expired > 0 {
                    info!(swept, pruned, expired, "reaper pass finished");
                }
            }
            debug!("reaper stopped");
        })
    }

    /// Status of a job owned by `account_id`. Other accounts' jobs are
    /// reported as missing.
    pub fn job_status(&self, job_id: &str, account_id: &str) -> Result<JobStatus, DownloadError> {
        let job = self
            .inner
            .jobs
            .lock()
            .get(job_id)
            .filter(|job| job.account_id == account_id)
            .cloned()
            .ok_or(DownloadError::NotFound)?;

        let state = match (job.state, job.handle.as_deref()) {
            (JobState::Staged, Some(handle)) => match self.inner.retrieval.status(handle) {
                Some(ArtifactStatus::Staged) => JobState::Staged,
                Some(ArtifactStatus::Served) => JobState::Served,
                Some(ArtifactStatus::Expired) | None => JobState::Expired,
            },
            (state, _) => state,
        };

        Ok(JobStatus {
            job_id: job.id,
            state,
            quality: job.quality.to_string(),
            message: job.message,
        })
    }

    async fn run(
        &self,
        job_id: &str,
        account_id: &str,
        url: &str,
        quality: Quality,
    ) -> Result<StagedDownload, DownloadError> {
        self.set_state(job_id, JobState::Resolving);
        let meta = self.resolve(url).await?;

        let selection = select_streams(&meta, quality)
            .map_err(|err| DownloadError::NoSuitableFormat(err.to_string()))?;
        self.set_state(job_id, JobState::FormatSelected);

        let scope = self
            .inner
            .retrieval
            .create_scope()
            .map_err(DownloadError::internal)?;
        self.set_state(job_id, JobState::Transcoding);

        let ext = quality.container.extension();
        let output = scope.dir().join(format!("output.{ext}"));
        let target = TranscodeTarget::new(quality.container, self.inner.settings.audio_bitrate_kbps);
        let transcode_timeout = self.inner.settings.transcode_timeout;
        let produced = timeout(
            transcode_timeout,
            self.produce(url, &selection, scope.dir(), &output, target),
        )
        .await;
        match produced {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                scope.discard();
                return Err(DownloadError::TranscodeFailed(format!("{err:#}")));
            }
            Err(_) => {
                scope.discard();
                return Err(DownloadError::TranscodeFailed(format!(
                    "timed out after {}s",
                    transcode_timeout.as_secs()
                )));
            }
        }

        let file_name =
            download_file_name(&meta.title, quality.container, Utc::now().timestamp_millis());
        tokio::fs::rename(&output, scope.dir().join(&file_name))
            .await
            .map_err(DownloadError::internal)?;
        let handle = self
            .inner
            .retrieval
            .register(scope, &file_name)
            .map_err(DownloadError::internal)?;
        self.update_job(job_id, |job| {
            job.state = JobState::Staged;
            job.handle = Some(handle.clone());
            job.message = file_name.clone();
            job.finished_at = Some(SystemTime::now());
        });

        let account = match self.inner.ledger.record_download(account_id).await {
            Ok(account) => account,
            Err(err) => {
                self.inner.retrieval.withdraw(&handle);
                return Err(DownloadError::internal(err));
            }
        };

        Ok(StagedDownload {
            job_id: job_id.to_owned(),
            handle,
            file_name,
            download_count: account.downloads_consumed,
        })
    }

    /// Fetches the selected streams into `dir` and transcodes them into
    /// `output`. Intermediate inputs are removed once the output exists.
    async fn produce(
        &self,
        url: &str,
        selection: &StreamSelection,
        dir: &Path,
        output: &Path,
        target: TranscodeTarget,
    ) -> anyhow::Result<()> {
        let mut inputs: Vec<PathBuf> = Vec::new();
        for (idx, stream) in selection.inputs().into_iter().enumerate() {
            let ext = stream
                .ext
                .as_deref()
                .filter(|ext| is_token_shaped(ext))
                .unwrap_or("bin");
            let dest = dir.join(format!("input-{idx}.{ext}"));
            self.inner
                .resolver
                .download_stream(url, stream, &dest)
                .await
                .with_context(|| format!("fetching stream {}", stream.id))?;
            inputs.push(dest);
        }

        self.inner
            .transcoder
            .transcode(&inputs, output, target)
            .await?;

        for input in &inputs {
            if let Err(err) = tokio::fs::remove_file(input).await {
                warn!(path = %input.display(), "failed to remove transcode input: {err}");
            }
        }
        Ok(())
    }

    async fn resolve(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        let resolve_timeout = self.inner.settings.resolve_timeout;
        match timeout(resolve_timeout, self.inner.resolver.resolve(url)).await {
            Ok(Ok(meta)) => Ok(meta),
            Ok(Err(err)) => {
                warn!(resolver = self.inner.resolver.name(), %url, "metadata lookup failed: {err:#}");
                Err(DownloadError::SourceUnresolvable(format!("{err:#}")))
            }
            Err(_) => Err(DownloadError::SourceUnresolvable(format!(
                "timed out after {}s",
                resolve_timeout.as_secs()
            ))),
        }
    }

    fn create_job(&self, account_id: &str, source_url: String, quality: Quality) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("job-{id}");
        self.inner.jobs.lock().insert(
            job_id.clone(),
            DownloadJob {
                id: job_id.clone(),
                account_id: account_id.to_owned(),
                source_url,
                quality,
                state: JobState::Requested,
                message: String::new(),
                handle: None,
                finished_at: None,
            },
        );
        job_id
    }

    fn set_state(&self, job_id: &str, state: JobState) {
        self.update_job(job_id, |job| job.state = state);
    }

    fn update_job(&self, job_id: &str, update: impl FnOnce(&mut DownloadJob)) {
        if let Some(job) = self.inner.jobs.lock().get_mut(job_id) {
            update(job);
            debug!(job = %job.id, state = ?job.state, url = %job.source_url, "job updated");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        account::{Account, AccountStore, InMemoryAccountStore, PlanTier},
        media::{StreamDescriptor, tests::sample_metadata},
    };
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    pub(crate) const SAMPLE_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    pub(crate) struct FakeResolver {
        pub meta: VideoMetadata,
        pub fail_with: Option<String>,
        pub delay: Duration,
        pub resolves: AtomicUsize,
        pub fetched: Mutex<Vec<String>>,
    }

    impl FakeResolver {
        pub fn new() -> Self {
            Self {
                meta: sample_metadata(),
                fail_with: None,
                delay: Duration::ZERO,
                resolves: AtomicUsize::new(0),
                fetched: Mutex::new(Vec::new()),
            }
        }

        pub fn resolve_calls(&self) -> usize {
            self.resolves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataResolver for FakeResolver {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn resolve(&self, url: &str) -> Result<VideoMetadata> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(message) = &self.fail_with {
                bail!("{message}");
            }
            let mut meta = self.meta.clone();
            meta.url = url.to_owned();
            Ok(meta)
        }

        async fn download_stream(
            &self,
            _url: &str,
            stream: &StreamDescriptor,
            dest: &Path,
        ) -> Result<()> {
            self.fetched.lock().push(stream.id.clone());
            tokio::fs::write(dest, stream.id.as_bytes()).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeTranscoder {
        pub fail: bool,
        pub delay: Duration,
        pub seen: Mutex<Vec<(usize, TranscodeTarget)>>,
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode(
            &self,
            inputs: &[PathBuf],
            dest: &Path,
            target: TranscodeTarget,
        ) -> Result<()> {
            self.seen.lock().push((inputs.len(), target));
            tokio::time::sleep(self.delay).await;
            if self.fail {
                bail!("encoder exploded");
            }
            let mut joined = Vec::new();
            for input in inputs {
                joined.extend(tokio::fs::read(input).await?);
            }
            tokio::fs::write(dest, joined).await?;
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub dir: TempDir,
        pub ledger: QuotaLedger,
        pub retrieval: Arc<RetrievalStore>,
        pub resolver: Arc<FakeResolver>,
        pub transcoder: Arc<FakeTranscoder>,
        pub coordinator: DownloadCoordinator,
    }

    impl Harness {
        pub fn scratch_entries(&self) -> usize {
            fs::read_dir(self.dir.path())
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    pub(crate) fn harness_with(
        ledger: QuotaLedger,
        resolver: FakeResolver,
        transcoder: FakeTranscoder,
        settings: CoordinatorSettings,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let retrieval = Arc::new(RetrievalStore::new(
            dir.path(),
            crate::retrieval::DEFAULT_STALE_AFTER,
        ));
        let resolver = Arc::new(resolver);
        let transcoder = Arc::new(transcoder);
        let coordinator = DownloadCoordinator::new(
            ledger.clone(),
            resolver.clone(),
            transcoder.clone(),
            retrieval.clone(),
            settings,
        );
        Harness {
            dir,
            ledger,
            retrieval,
            resolver,
            transcoder,
            coordinator,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver::new(),
            FakeTranscoder::default(),
            CoordinatorSettings::default(),
        )
    }

    fn q(token: &str) -> Quality {
        token.parse().unwrap()
    }

    async fn read_artifact(h: &Harness, staged: &StagedDownload) -> Vec<u8> {
        let served = h
            .retrieval
            .fetch(&staged.handle, &staged.file_name)
            .await
            .unwrap();
        let mut body = served.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn video_download_is_staged_and_counted() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let staged = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap();
        assert_eq!(staged.download_count, 1);
        assert!(staged.file_name.starts_with("NeverGonnaGiveYouUp-"));
        assert!(staged.file_name.ends_with(".mp4"));
        assert_eq!(
            staged.download_url(),
            format!("/api/download-file/{}/{}", staged.handle, staged.file_name)
        );
        assert_eq!(*h.resolver.fetched.lock(), vec!["136", "140"]);
        assert_eq!(h.transcoder.seen.lock()[0].0, 2);

        let status = h.coordinator.job_status(&staged.job_id, "u1@test.com").unwrap();
        assert_eq!(status.state, JobState::Staged);
        assert_eq!(status.quality, "720p-mp4");

        // video bytes come first, then audio
        assert_eq!(read_artifact(&h, &staged).await, b"136140");
        let status = h.coordinator.job_status(&staged.job_id, "u1@test.com").unwrap();
        assert_eq!(status.state, JobState::Served);
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(h.ledger.account("u1@test.com").await.unwrap().downloads_consumed, 1);
    }

    #[tokio::test]
    async fn audio_download_uses_configured_bitrate() {
        let h = harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver::new(),
            FakeTranscoder::default(),
            CoordinatorSettings {
                audio_bitrate_kbps: 256,
                ..CoordinatorSettings::default()
            },
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let staged = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("2160p-mp3"))
            .await
            .unwrap();
        assert!(staged.file_name.ends_with(".mp3"));
        let (inputs, target) = h.transcoder.seen.lock()[0];
        assert_eq!(inputs, 1);
        assert_eq!(target.audio_bitrate_kbps, 256);
        assert_eq!(*h.resolver.fetched.lock(), vec!["18"]);
    }

    #[tokio::test]
    async fn exhausted_quota_is_refused_without_side_effects() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        for _ in 0..10 {
            h.ledger.record_download("u1@test.com").await.unwrap();
        }

        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::QuotaExceeded);
        assert_eq!(h.resolver.resolve_calls(), 0);
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(h.ledger.account("u1@test.com").await.unwrap().downloads_consumed, 10);
    }

    #[tokio::test]
    async fn high_resolutions_need_premium() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("2160p-mp4"))
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::PremiumRequired(Resolution::P2160));
        assert_eq!(h.resolver.resolve_calls(), 0);

        h.ledger.upgrade("u1@test.com").await.unwrap();
        let staged = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("2160p-mp4"))
            .await
            .unwrap();
        assert_eq!(staged.download_count, 0, "premium downloads are not counted");
        assert_eq!(h.resolver.fetched.lock()[0], "137");
    }

    #[tokio::test]
    async fn invalid_urls_never_reach_the_resolver() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let err = h
            .coordinator
            .submit("u1@test.com", "not-a-youtube-link", q("720p-mp4"))
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::invalid_url());
        assert!(h.coordinator.video_info("not-a-youtube-link").await.is_err());
        assert_eq!(h.resolver.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn video_info_resolves_canonical_url() {
        let h = harness();
        let meta = h
            .coordinator
            .video_info("https://youtu.be/dQw4w9WgXcQ?si=share")
            .await
            .unwrap();
        assert_eq!(meta.url, SAMPLE_URL);
        assert_eq!(meta.streams.len(), 6);
    }

    #[tokio::test]
    async fn resolver_failure_marks_job_failed() {
        let resolver = FakeResolver {
            fail_with: Some("Video unavailable".into()),
            ..FakeResolver::new()
        };
        let h = harness_with(
            QuotaLedger::in_memory(10),
            resolver,
            FakeTranscoder::default(),
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DownloadError::SourceUnresolvable("Video unavailable".into())
        );
        let status = h.coordinator.job_status("job-1", "u1@test.com").unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.message.contains("Video unavailable"));
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(h.ledger.account("u1@test.com").await.unwrap().downloads_consumed, 0);
    }

    #[tokio::test]
    async fn missing_formats_are_reported() {
        let mut resolver = FakeResolver::new();
        resolver.meta.streams.clear();
        let h = harness_with(
            QuotaLedger::in_memory(10),
            resolver,
            FakeTranscoder::default(),
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("480p-mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoSuitableFormat(_)));
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn transcode_failure_leaves_no_scratch_files() {
        let h = harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver::new(),
            FakeTranscoder {
                fail: true,
                ..FakeTranscoder::default()
            },
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::TranscodeFailed(ref msg) if msg.contains("encoder exploded")));
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(h.ledger.account("u1@test.com").await.unwrap().downloads_consumed, 0);
    }

    #[tokio::test]
    async fn slow_collaborators_time_out() {
        let h = harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver {
                delay: Duration::from_secs(5),
                ..FakeResolver::new()
            },
            FakeTranscoder::default(),
            CoordinatorSettings {
                resolve_timeout: Duration::from_millis(50),
                ..CoordinatorSettings::default()
            },
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::SourceUnresolvable(ref msg) if msg.contains("timed out")));

        let h = harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver::new(),
            FakeTranscoder {
                delay: Duration::from_secs(5),
                ..FakeTranscoder::default()
            },
            CoordinatorSettings {
                transcode_timeout: Duration::from_millis(50),
                ..CoordinatorSettings::default()
            },
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::TranscodeFailed(ref msg) if msg.contains("timed out")));
        assert_eq!(h.scratch_entries(), 0);
    }

    /// Accounts vanish between the entitlement check and accounting.
    struct VanishingStore(InMemoryAccountStore);

    impl AccountStore for VanishingStore {
        fn get(&self, id: &str) -> Result<Option<Account>> {
            self.0.get(id)
        }
        fn insert(&self, account: &Account) -> Result<bool> {
            self.0.insert(account)
        }
        fn set_plan(&self, id: &str, plan: PlanTier) -> Result<Option<Account>> {
            self.0.set_plan(id, plan)
        }
        fn increment_downloads(&self, _id: &str) -> Result<Option<Account>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn accounting_failure_withdraws_the_artifact() {
        let ledger = QuotaLedger::new(Arc::new(VanishingStore(InMemoryAccountStore::new())), 10);
        let h = harness_with(
            ledger,
            FakeResolver::new(),
            FakeTranscoder::default(),
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let err = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Internal(_)));
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn jobs_are_private_to_their_account() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let staged = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("360p-mp4"))
            .await
            .unwrap();
        assert_eq!(
            h.coordinator.job_status(&staged.job_id, "u2@test.com").unwrap_err(),
            DownloadError::NotFound
        );
        assert_eq!(
            h.coordinator.job_status("job-999", "u1@test.com").unwrap_err(),
            DownloadError::NotFound
        );
    }

    #[tokio::test]
    async fn dropped_submission_marks_job_failed() {
        let h = harness_with(
            QuotaLedger::in_memory(10),
            FakeResolver::new(),
            FakeTranscoder {
                delay: Duration::from_secs(5),
                ..FakeTranscoder::default()
            },
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();

        let outcome = timeout(
            Duration::from_millis(100),
            h.coordinator.submit("u1@test.com", SAMPLE_URL, q("720p-mp4")),
        )
        .await;
        assert!(outcome.is_err());

        let status = h.coordinator.job_status("job-1", "u1@test.com").unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.message, "cancelled");
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(h.ledger.account("u1@test.com").await.unwrap().downloads_consumed, 0);
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_once_stale() {
        let h = harness();
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        let served = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("360p-mp4"))
            .await
            .unwrap();
        read_artifact(&h, &served).await;
        let waiting = h
            .coordinator
            .submit("u1@test.com", SAMPLE_URL, q("480p-mp4"))
            .await
            .unwrap();

        let now = SystemTime::now();
        assert_eq!(h.coordinator.prune_jobs_at(now), 0);

        let later = now + Duration::from_secs(3 * 60 * 60);
        assert_eq!(h.coordinator.prune_jobs_at(later), 1);
        assert_eq!(
            h.coordinator.job_status(&served.job_id, "u1@test.com").unwrap_err(),
            DownloadError::NotFound
        );
        assert_eq!(
            h.coordinator.job_status(&waiting.job_id, "u1@test.com").unwrap().state,
            JobState::Staged,
            "an unfetched artifact keeps its job"
        );

        assert_eq!(h.retrieval.sweep_at(later), 1);
        assert_eq!(
            h.coordinator.job_status(&waiting.job_id, "u1@test.com").unwrap().state,
            JobState::Expired
        );
        assert_eq!(h.coordinator.prune_jobs_at(later), 1);
        assert!(h.coordinator.job_status(&waiting.job_id, "u1@test.com").is_err());
    }

    #[tokio::test]
    async fn failed_jobs_are_pruned_once_stale() {
        let resolver = FakeResolver {
            fail_with: Some("Video unavailable".into()),
            ..FakeResolver::new()
        };
        let h = harness_with(
            QuotaLedger::in_memory(10),
            resolver,
            FakeTranscoder::default(),
            CoordinatorSettings::default(),
        );
        h.ledger.register("u1@test.com", "pw").await.unwrap();
        for _ in 0..3 {
            let _ = h
                .coordinator
                .submit("u1@test.com", SAMPLE_URL, q("720p-mp4"))
                .await;
        }
        let later = SystemTime::now() + Duration::from_secs(3 * 60 * 60);
        assert_eq!(h.coordinator.prune_jobs_at(later), 3);
        assert_eq!(h.coordinator.prune_jobs_at(later), 0);
    }

    #[tokio::test]
    async fn reaper_stops_on_cancel() {
        let h = harness();
        let sessions = Arc::new(SessionRegistry::new(None));
        let cancel = CancellationToken::new();
        let task = h
            .coordinator
            .spawn_reaper(sessions, Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_accounts_are_unauthorized() {
        let h = harness();
        let err = h
            .coordinator
            .submit("ghost@test.com", SAMPLE_URL, q("720p-mp4"))
            .await
            .unwrap_err();
        assert_eq!(err, DownloadError::Unauthorized);
    }
}
