//! In-memory doubles for the daemon control and file store seams.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use stowage_transfer_core::{
    DaemonControl, DaemonError, DaemonJobId, DaemonProgress, DaemonResult, DaemonState,
    DaemonStatus, FileStore, StoreError, StoreReader, StoreResult, StoreWriter,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory test double for the download daemon.
#[derive(Default)]
pub struct StubDaemon {
    state: Mutex<StubState>,
}

#[derive(Default)]
struct StubState {
    jobs: HashMap<DaemonJobId, StubJob>,
    next_id: u64,
    unreachable: bool,
    abort_unreachable: bool,
    reject_next_add: Option<String>,
    add_delay: Option<Duration>,
    status_delay: Option<Duration>,
    add_calls: usize,
    status_calls: usize,
    aborted: Vec<DaemonJobId>,
}

#[derive(Clone)]
struct StubJob {
    source_uri: String,
    staging: PathBuf,
    status: DaemonStatus,
}

impl StubDaemon {
    /// A reachable daemon with no jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle whether every call fails with [`DaemonError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    /// Toggle whether `abort` alone fails with [`DaemonError::Unreachable`].
    pub fn set_abort_reachable(&self, reachable: bool) {
        lock(&self.state).abort_unreachable = !reachable;
    }

    /// Reject the next `add_fetch` with `message`.
    pub fn reject_next_add(&self, message: impl Into<String>) {
        lock(&self.state).reject_next_add = Some(message.into());
    }

    /// Delay every `add_fetch` reply.
    pub fn set_add_delay(&self, delay: Duration) {
        lock(&self.state).add_delay = Some(delay);
    }

    /// Delay every `status` reply.
    pub fn set_status_delay(&self, delay: Option<Duration>) {
        lock(&self.state).status_delay = delay;
    }

    /// Report `state` for a job.
    pub fn set_state(&self, id: &DaemonJobId, state: DaemonState) {
        if let Some(job) = lock(&self.state).jobs.get_mut(id) {
            job.status.state = state;
        }
    }

    /// Report progress counters for a job.
    pub fn set_progress(&self, id: &DaemonJobId, progress: DaemonProgress) {
        if let Some(job) = lock(&self.state).jobs.get_mut(id) {
            job.status.progress = progress;
        }
    }

    /// Mark a job complete with the given payload files.
    pub fn complete(&self, id: &DaemonJobId, files: Vec<PathBuf>) {
        if let Some(job) = lock(&self.state).jobs.get_mut(id) {
            job.status.state = DaemonState::Complete;
            job.status.files = files;
        }
    }

    /// Finish a job's metadata stage and continue its payload under a new
    /// identifier, the way aria2 follows a magnet link. Returns the follow-up.
    pub fn hand_off(&self, id: &DaemonJobId) -> Option<DaemonJobId> {
        let mut state = lock(&self.state);
        let mut follow_up = state.jobs.get(id)?.clone();
        state.next_id += 1;
        let follow_id = DaemonJobId::new(format!("{:016x}", state.next_id));
        follow_up.status = DaemonStatus {
            state: DaemonState::Active,
            progress: DaemonProgress::default(),
            error_detail: None,
            files: Vec::new(),
            followed_by: Vec::new(),
        };
        state.jobs.insert(follow_id.clone(), follow_up);
        if let Some(job) = state.jobs.get_mut(id) {
            job.status.state = DaemonState::Active;
            job.status.followed_by = vec![follow_id.clone()];
        }
        Some(follow_id)
    }

    /// Mark a job failed with `detail`.
    pub fn fail(&self, id: &DaemonJobId, detail: impl Into<String>) {
        if let Some(job) = lock(&self.state).jobs.get_mut(id) {
            job.status.state = DaemonState::Error;
            job.status.error_detail = Some(detail.into());
        }
    }

    /// Drop every job, as a daemon restart without a session file would.
    pub fn forget_all(&self) {
        lock(&self.state).jobs.clear();
    }

    /// Staging directory the job was submitted with.
    #[must_use]
    pub fn staging_of(&self, id: &DaemonJobId) -> Option<PathBuf> {
        lock(&self.state)
            .jobs
            .get(id)
            .map(|job| job.staging.clone())
    }

    /// Source URI the job was submitted with.
    #[must_use]
    pub fn source_of(&self, id: &DaemonJobId) -> Option<String> {
        lock(&self.state)
            .jobs
            .get(id)
            .map(|job| job.source_uri.clone())
    }

    /// Identifiers of every job the daemon holds.
    #[must_use]
    pub fn job_ids(&self) -> Vec<DaemonJobId> {
        lock(&self.state).jobs.keys().cloned().collect()
    }

    /// Jobs aborted so far, in call order.
    #[must_use]
    pub fn aborted(&self) -> Vec<DaemonJobId> {
        lock(&self.state).aborted.clone()
    }

    /// Number of `add_fetch` calls received.
    #[must_use]
    pub fn add_calls(&self) -> usize {
        lock(&self.state).add_calls
    }

    /// Number of `status` calls received.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        lock(&self.state).status_calls
    }

    fn check_reachable(&self, operation: &'static str) -> DaemonResult<()> {
        if lock(&self.state).unreachable {
            return Err(DaemonError::Unreachable {
                operation,
                detail: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonControl for StubDaemon {
    async fn add_fetch(
        &self,
        source_uri: &str,
        staging_hint: &Path,
    ) -> DaemonResult<DaemonJobId> {
        let delay = {
            let mut state = lock(&self.state);
            state.add_calls += 1;
            state.add_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable("add_fetch")?;

        let mut state = lock(&self.state);
        if let Some(message) = state.reject_next_add.take() {
            return Err(DaemonError::Rejected {
                operation: "add_fetch",
                message,
            });
        }
        state.next_id += 1;
        let id = DaemonJobId::new(format!("{:016x}", state.next_id));
        state.jobs.insert(
            id.clone(),
            StubJob {
                source_uri: source_uri.to_string(),
                staging: staging_hint.to_path_buf(),
                status: DaemonStatus {
                    state: DaemonState::Active,
                    progress: DaemonProgress::default(),
                    error_detail: None,
                    files: Vec::new(),
                    followed_by: Vec::new(),
                },
            },
        );
        Ok(id)
    }

    async fn status(&self, id: &DaemonJobId) -> DaemonResult<DaemonStatus> {
        let delay = {
            let mut state = lock(&self.state);
            state.status_calls += 1;
            state.status_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable("status")?;
        lock(&self.state)
            .jobs
            .get(id)
            .map(|job| job.status.clone())
            .ok_or_else(|| DaemonError::UnknownJob { id: id.clone() })
    }

    async fn abort(&self, id: &DaemonJobId) -> DaemonResult<()> {
        self.check_reachable("abort")?;
        let mut state = lock(&self.state);
        if state.abort_unreachable {
            return Err(DaemonError::Unreachable {
                operation: "abort",
                detail: "connection reset".into(),
            });
        }
        let Some(job) = state.jobs.get_mut(id) else {
            return Err(DaemonError::UnknownJob { id: id.clone() });
        };
        job.status.state = DaemonState::Removed;
        state.aborted.push(id.clone());
        Ok(())
    }

    async fn list_jobs(&self) -> DaemonResult<Vec<DaemonJobId>> {
        self.check_reachable("list_jobs")?;
        Ok(self.job_ids())
    }
}

/// Faults a [`MemoryFileStore`] injects into the next operations.
#[derive(Debug, Clone, Default)]
pub struct StoreFaults {
    /// Refuse every writable resource.
    pub deny_writes: bool,
    /// Refuse every readable resource.
    pub deny_reads: bool,
    /// Fail the first read of every readable resource.
    pub fail_reads: bool,
    /// Fail writes once this many bytes were accepted.
    pub fail_write_after: Option<usize>,
    /// Fail the commit of every writer.
    pub fail_commit: bool,
    /// Fail every import.
    pub fail_import: bool,
}

type FileMap = Arc<Mutex<HashMap<(String, String), Vec<u8>>>>;

/// Fault-injecting in-memory file store.
#[derive(Default)]
pub struct MemoryFileStore {
    files: FileMap,
    faults: Mutex<StoreFaults>,
    destroyed: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    imports: Mutex<Vec<PathBuf>>,
}

impl MemoryFileStore {
    /// An empty store without faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active fault set.
    pub fn set_faults(&self, faults: StoreFaults) {
        *lock(&self.faults) = faults;
    }

    /// Seed a file.
    pub fn put(&self, owner: &str, path: &str, bytes: impl Into<Vec<u8>>) {
        lock(&self.files).insert((owner.to_string(), path.to_string()), bytes.into());
    }

    /// Committed contents of a file.
    #[must_use]
    pub fn get(&self, owner: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.files)
            .get(&(owner.to_string(), path.to_string()))
            .cloned()
    }

    /// Writers destroyed so far.
    #[must_use]
    pub fn destroyed_writes(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Readers released or dropped so far.
    #[must_use]
    pub fn released_reads(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Artifacts imported so far.
    #[must_use]
    pub fn imports(&self) -> Vec<PathBuf> {
        lock(&self.imports).clone()
    }

    fn faults(&self) -> StoreFaults {
        lock(&self.faults).clone()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn readable(&self, owner: &str, path: &str) -> StoreResult<Box<dyn StoreReader>> {
        if self.faults().deny_reads {
            return Err(StoreError::denied(path, "reads_denied"));
        }
        let data = self.get(owner, path).ok_or_else(|| StoreError::NotFound {
            path: path.to_string(),
        })?;
        Ok(Box::new(MemoryReader {
            data: io::Cursor::new(data),
            released: Arc::clone(&self.released),
            fail: self.faults().fail_reads,
        }))
    }

    async fn writable(
        &self,
        owner: &str,
        path: &str,
        _declared_size: u64,
    ) -> StoreResult<Box<dyn StoreWriter>> {
        let faults = self.faults();
        if faults.deny_writes {
            return Err(StoreError::denied(path, "writes_denied"));
        }
        Ok(Box::new(MemoryWriter {
            key: (owner.to_string(), path.to_string()),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            destroyed: Arc::clone(&self.destroyed),
            fail_write_after: faults.fail_write_after,
            fail_commit: faults.fail_commit,
        }))
    }

    async fn import(&self, owner: &str, path: &str, artifact: &Path) -> StoreResult<()> {
        if self.faults().fail_import {
            return Err(StoreError::io(
                "import",
                artifact,
                io::Error::other("injected import failure"),
            ));
        }
        let bytes = tokio::fs::read(artifact)
            .await
            .map_err(|err| StoreError::io("import", artifact, err))?;
        self.put(owner, path, bytes);
        lock(&self.imports).push(artifact.to_path_buf());
        Ok(())
    }

    async fn contains(&self, owner: &str, path: &str) -> StoreResult<bool> {
        Ok(self.get(owner, path).is_some())
    }
}

struct MemoryReader {
    data: io::Cursor<Vec<u8>>,
    released: Arc<AtomicUsize>,
    fail: bool,
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::other("injected read failure")));
        }
        Pin::new(&mut self.data).poll_read(cx, buf)
    }
}

#[async_trait]
impl StoreReader for MemoryReader {
    async fn release(self: Box<Self>) {}
}

struct MemoryWriter {
    key: (String, String),
    buffer: Vec<u8>,
    files: FileMap,
    destroyed: Arc<AtomicUsize>,
    fail_write_after: Option<usize>,
    fail_commit: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self
            .fail_write_after
            .is_some_and(|limit| self.buffer.len() + buf.len() > limit)
        {
            return Poll::Ready(Err(io::Error::other("injected write failure")));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl StoreWriter for MemoryWriter {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.fail_commit {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::io(
                "commit",
                PathBuf::from(&self.key.1),
                io::Error::other("injected commit failure"),
            ));
        }
        let Self {
            key, buffer, files, ..
        } = *self;
        lock(&files).insert(key, buffer);
        Ok(())
    }

    async fn destroy(self: Box<Self>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
