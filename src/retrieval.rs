//! Staged artifacts, one-shot retrieval and the scratch sweep.
//!
//! Every job works inside its own scope directory, `<scratch_root>/<handle>/`.
//! While the job runs the scope carries an in-progress marker so the sweep
//! leaves it alone. Once staged, the handle can be fetched exactly once; the
//! scope disappears as soon as the transfer finishes or is abandoned.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context as TaskContext, Poll},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::security::{is_token_shaped, retrieval_handle};

pub const IN_PROGRESS_MARKER: &str = ".in-progress";
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("File not found")]
pub struct ArtifactNotFound;

/// A job's private working directory. Dropping an unregistered scope deletes
/// it, so every early return and cancelled future cleans up after itself.
#[derive(Debug)]
pub struct ScratchScope {
    handle: String,
    dir: PathBuf,
    armed: bool,
}

impl ScratchScope {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes the scope now instead of waiting for drop.
    pub fn discard(mut self) {
        self.armed = false;
        remove_scope(&self.dir);
    }
}

impl Drop for ScratchScope {
    fn drop(&mut self) {
        if self.armed {
            remove_scope(&self.dir);
        }
    }
}

/// Where a handle stands from the retrieval side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Staged,
    Served,
    Expired,
}

#[derive(Debug, Clone)]
struct StagedArtifact {
    scope: PathBuf,
    file_name: String,
}

/// An artifact claimed by [`RetrievalStore::fetch`].
pub struct ServedArtifact {
    pub file_name: String,
    pub size: u64,
    pub body: ArtifactStream,
}

/// File body stream that removes its scope once fully read or dropped.
pub struct ArtifactStream {
    inner: ReaderStream<tokio::fs::File>,
    scope: Option<PathBuf>,
}

impl ArtifactStream {
    fn cleanup(&mut self) {
        if let Some(scope) = self.scope.take() {
            remove_scope(&scope);
        }
    }
}

impl Stream for ArtifactStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = Pin::new(&mut this.inner).poll_next(cx);
        if let Poll::Ready(None) = next {
            this.cleanup();
        }
        next
    }
}

impl Drop for ArtifactStream {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub struct RetrievalStore {
    root: PathBuf,
    stale_after: Duration,
    artifacts: Mutex<HashMap<String, StagedArtifact>>,
    /// Handles that left the store, kept until the next sweep past the stale
    /// threshold so job status can report how they went.
    departed: Mutex<HashMap<String, (ArtifactStatus, SystemTime)>>,
}

impl RetrievalStore {
    pub fn new(root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            root: root.into(),
            stale_after,
            artifacts: Mutex::new(HashMap::new()),
            departed: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Creates a fresh scope directory with the in-progress marker in place.
    pub fn create_scope(&self) -> Result<ScratchScope> {
        let handle = retrieval_handle();
        let dir = self.root.join(&handle);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let scope = ScratchScope {
            handle,
            dir,
            armed: true,
        };
        let marker = scope.dir.join(IN_PROGRESS_MARKER);
        fs::write(&marker, b"").with_context(|| format!("creating {}", marker.display()))?;
        Ok(scope)
    }

    /// Publishes `file_name` inside `scope` under the scope's handle. The
    /// marker is removed and the scope is no longer deleted on drop.
    pub fn register(&self, mut scope: ScratchScope, file_name: &str) -> Result<String> {
        let file_path = scope.dir.join(file_name);
        ensure!(
            file_path.is_file(),
            "staged file {} is missing",
            file_path.display()
        );
        let marker = scope.dir.join(IN_PROGRESS_MARKER);
        if let Err(err) = fs::remove_file(&marker)
            && err.kind() != io::ErrorKind::NotFound
        {
            return Err(err).with_context(|| format!("removing {}", marker.display()));
        }

        scope.armed = false;
        let handle = scope.handle.clone();
        self.artifacts.lock().insert(
            handle.clone(),
            StagedArtifact {
                scope: scope.dir.clone(),
                file_name: file_name.to_owned(),
            },
        );
        Ok(handle)
    }

    /// Drops a registered artifact without serving it.
    pub fn withdraw(&self, handle: &str) -> bool {
        let removed = self.artifacts.lock().remove(handle);
        match removed {
            Some(artifact) => {
                self.mark_departed(handle, ArtifactStatus::Expired, SystemTime::now());
                remove_scope(&artifact.scope);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.artifacts.lock().contains_key(handle)
    }

    /// `None` when the handle was never registered or has been forgotten.
    pub fn status(&self, handle: &str) -> Option<ArtifactStatus> {
        if self.contains(handle) {
            return Some(ArtifactStatus::Staged);
        }
        self.departed.lock().get(handle).map(|(status, _)| *status)
    }

    fn mark_departed(&self, handle: &str, status: ArtifactStatus, at: SystemTime) {
        self.departed.lock().insert(handle.to_owned(), (status, at));
    }

    /// Claims the artifact behind `handle`. The handle is forgotten before the
    /// file is opened, so a second fetch fails even while the first transfer
    /// is still running.
    pub async fn fetch(
        &self,
        handle: &str,
        file_name: &str,
    ) -> Result<ServedArtifact, ArtifactNotFound> {
        if !is_token_shaped(handle) {
            return Err(ArtifactNotFound);
        }
        let artifact = {
            let mut artifacts = self.artifacts.lock();
            let name_matches = artifacts
                .get(handle)
                .is_some_and(|artifact| artifact.file_name == file_name);
            if name_matches {
                artifacts.remove(handle)
            } else {
                None
            }
        }
        .ok_or(ArtifactNotFound)?;
        self.mark_departed(handle, ArtifactStatus::Served, SystemTime::now());

        let path = artifact.scope.join(&artifact.file_name);
        let opened = match tokio::fs::File::open(&path).await {
            Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
            Err(err) => Err(err),
        };
        let (file, size) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                warn!(path = %path.display(), "staged artifact unreadable: {err}");
                remove_scope(&artifact.scope);
                return Err(ArtifactNotFound);
            }
        };

        debug!(%handle, size, "serving staged artifact");
        Ok(ServedArtifact {
            file_name: artifact.file_name,
            size,
            body: ArtifactStream {
                inner: ReaderStream::new(file),
                scope: Some(artifact.scope),
            },
        })
    }

    /// Deletes scopes untouched for longer than the stale threshold, skipping
    /// any that still carry the in-progress marker. Returns how many entries
    /// were removed.
    pub fn sweep_at(&self, now: SystemTime) -> usize {
        self.departed.lock().retain(|_, (_, at)| {
            now.duration_since(*at).unwrap_or_default() <= self.stale_after
        });
        if !self.root.exists() {
            return 0;
        }
        let mut removed = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if entry.file_type().is_dir() && path.join(IN_PROGRESS_MARKER).exists() {
                continue;
            }
            let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok())
            else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.stale_after {
                continue;
            }

            if let Some(name) = path.file_name().and_then(|name| name.to_str())
                && self.artifacts.lock().remove(name).is_some()
            {
                self.mark_departed(name, ArtifactStatus::Expired, now);
            }
            let result = if entry.file_type().is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), "sweep failed to remove entry: {err}"),
            }
        }
        removed
    }

    /// Empties the scratch root. Handles never survive a restart, so anything
    /// found at startup is an orphan.
    pub fn purge_all(&self) -> Result<usize> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        self.artifacts.lock().clear();
        self.departed.lock().clear();
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
        {
            let path = entry?.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), "failed to purge entry: {err}"),
            }
        }
        Ok(removed)
    }
}

/// Blocking, and called from async code as well: stream EOF, drops and
/// `discard`. A scope holds the staged file plus at most two inputs.
fn remove_scope(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %dir.display(), "failed to remove scratch scope: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::tempdir;

    fn stage(store: &RetrievalStore, name: &str, contents: &[u8]) -> String {
        let scope = store.create_scope().unwrap();
        fs::write(scope.dir().join(name), contents).unwrap();
        store.register(scope, name).unwrap()
    }

    async fn drain(mut body: ArtifactStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[test]
    fn scope_carries_marker_until_registered() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let scope = store.create_scope().unwrap();
        let scope_dir = scope.dir().to_path_buf();
        assert!(scope_dir.join(IN_PROGRESS_MARKER).exists());
        assert_eq!(scope_dir.parent(), Some(dir.path()));

        fs::write(scope_dir.join("clip-1.mp4"), b"data").unwrap();
        let handle = store.register(scope, "clip-1.mp4").unwrap();
        assert!(!scope_dir.join(IN_PROGRESS_MARKER).exists());
        assert!(store.contains(&handle));
        assert!(scope_dir.join("clip-1.mp4").exists());
    }

    #[test]
    fn dropped_scope_is_deleted() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let scope = store.create_scope().unwrap();
        let scope_dir = scope.dir().to_path_buf();
        fs::write(scope_dir.join("input-0"), b"partial").unwrap();
        drop(scope);
        assert!(!scope_dir.exists());

        let scope = store.create_scope().unwrap();
        let scope_dir = scope.dir().to_path_buf();
        scope.discard();
        assert!(!scope_dir.exists());
    }

    #[test]
    fn register_requires_the_file() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let scope = store.create_scope().unwrap();
        let scope_dir = scope.dir().to_path_buf();
        assert!(store.register(scope, "missing.mp4").is_err());
        assert!(!scope_dir.exists());
    }

    #[tokio::test]
    async fn fetch_streams_once_and_cleans_up() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let handle = stage(&store, "song-1.mp3", b"id3-bytes");
        let scope_dir = dir.path().join(&handle);

        let served = store.fetch(&handle, "song-1.mp3").await.unwrap();
        assert_eq!(served.size, 9);
        assert_eq!(served.file_name, "song-1.mp3");
        assert!(store.fetch(&handle, "song-1.mp3").await.is_err());

        assert_eq!(drain(served.body).await, b"id3-bytes");
        assert!(!scope_dir.exists());
        assert_eq!(store.status(&handle), Some(ArtifactStatus::Served));
    }

    #[tokio::test]
    async fn abandoned_transfer_still_cleans_up() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let handle = stage(&store, "clip-2.mp4", &[7u8; 128 * 1024]);
        let scope_dir = dir.path().join(&handle);

        let served = store.fetch(&handle, "clip-2.mp4").await.unwrap();
        let mut body = served.body;
        assert!(body.next().await.is_some());
        drop(body);
        assert!(!scope_dir.exists());
    }

    #[tokio::test]
    async fn fetch_rejects_wrong_name_and_unknown_handles() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let handle = stage(&store, "clip-3.mp4", b"x");

        assert!(store.fetch(&handle, "other.mp4").await.is_err());
        assert!(store.contains(&handle), "wrong name must not burn the handle");
        assert!(store.fetch("../etc", "passwd").await.is_err());
        assert!(store.fetch(&retrieval_handle(), "clip-3.mp4").await.is_err());
        assert!(store.fetch(&handle, "clip-3.mp4").await.is_ok());
    }

    #[test]
    fn withdraw_removes_scope_and_handle() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), DEFAULT_STALE_AFTER);
        let handle = stage(&store, "a-1.mp4", b"x");
        assert_eq!(store.status(&handle), Some(ArtifactStatus::Staged));
        assert!(store.withdraw(&handle));
        assert!(!store.withdraw(&handle));
        assert_eq!(store.status(&handle), Some(ArtifactStatus::Expired));
        assert!(!dir.path().join(&handle).exists());
    }

    #[test]
    fn sweep_removes_only_stale_finished_scopes() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path(), Duration::from_secs(2 * 60 * 60));
        let staged = stage(&store, "old-1.mp4", b"x");
        let running = store.create_scope().unwrap();
        let running_dir = running.dir().to_path_buf();

        let now = SystemTime::now();
        assert_eq!(store.sweep_at(now), 0);
        assert!(store.contains(&staged));

        let later = now + Duration::from_secs(3 * 60 * 60);
        assert_eq!(store.sweep_at(later), 1);
        assert!(!store.contains(&staged));
        assert!(!dir.path().join(&staged).exists());
        assert!(running_dir.exists(), "in-progress scopes survive the sweep");
        assert_eq!(store.status(&staged), Some(ArtifactStatus::Expired));

        let much_later = later + Duration::from_secs(3 * 60 * 60);
        store.sweep_at(much_later);
        assert_eq!(store.status(&staged), None);
        drop(running);
    }

    #[test]
    fn sweep_on_missing_root_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = RetrievalStore::new(dir.path().join("absent"), DEFAULT_STALE_AFTER);
        assert_eq!(store.sweep_at(SystemTime::now()), 0);
    }

    #[test]
    fn purge_all_empties_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("scratch");
        let store = RetrievalStore::new(&root, DEFAULT_STALE_AFTER);
        let handle = stage(&store, "x-1.mp4", b"x");
        let leftover = store.create_scope().unwrap();
        fs::write(root.join("stray.tmp"), b"").unwrap();

        assert_eq!(store.purge_all().unwrap(), 3);
        assert!(!store.contains(&handle));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        drop(leftover);
    }
}
