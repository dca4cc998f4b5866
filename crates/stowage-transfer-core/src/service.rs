//! Seams implemented by file stores, upload sources, and download daemons.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{DaemonResult, StoreResult};
use crate::model::{DaemonJobId, DaemonStatus, SourceChunk};

/// Readable handle on a stored file.
#[async_trait]
pub trait StoreReader: AsyncRead + Send + Unpin {
    /// Release the handle; dropping has the same effect.
    async fn release(self: Box<Self>);
}

/// Writable handle on a file being created in the store.
///
/// Bytes are invisible to readers until [`StoreWriter::commit`] succeeds.
#[async_trait]
pub trait StoreWriter: AsyncWrite + Send + Unpin {
    /// Make the written bytes visible at the target path.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard everything written so far.
    async fn destroy(self: Box<Self>);
}

/// Per-owner file store the transfer subsystem reads from and writes into.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Open an existing file for reading.
    async fn readable(&self, owner: &str, path: &str) -> StoreResult<Box<dyn StoreReader>>;

    /// Obtain a writable resource for a new file of `declared_size` bytes.
    async fn writable(
        &self,
        owner: &str,
        path: &str,
        declared_size: u64,
    ) -> StoreResult<Box<dyn StoreWriter>>;

    /// Move an artifact from the filesystem into the owner's store.
    async fn import(&self, owner: &str, path: &str, artifact: &Path) -> StoreResult<()>;

    /// Whether a file exists at `path` for `owner`.
    async fn contains(&self, owner: &str, path: &str) -> StoreResult<bool>;
}

/// Producer of upload bytes.
///
/// Sources report how they ended so a client disconnect is never mistaken
/// for a clean finish.
#[async_trait]
pub trait UploadSource: Send {
    /// Pull the next chunk of the upload.
    async fn next_chunk(&mut self) -> io::Result<SourceChunk>;
}

#[async_trait]
impl<S: UploadSource + ?Sized> UploadSource for Box<S> {
    async fn next_chunk(&mut self) -> io::Result<SourceChunk> {
        (**self).next_chunk().await
    }
}

/// Control surface of the external download daemon.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Hand a fetch to the daemon, writing into `staging_hint`.
    async fn add_fetch(&self, source_uri: &str, staging_hint: &Path)
    -> DaemonResult<DaemonJobId>;

    /// Query the daemon for one of its jobs.
    async fn status(&self, id: &DaemonJobId) -> DaemonResult<DaemonStatus>;

    /// Stop a fetch and drop it from the daemon.
    async fn abort(&self, id: &DaemonJobId) -> DaemonResult<()>;

    /// Every job the daemon currently knows about.
    async fn list_jobs(&self) -> DaemonResult<Vec<DaemonJobId>>;
}
