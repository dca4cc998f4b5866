//! Reader and writer handles over local files.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use stowage_transfer_core::{StoreError, StoreReader, StoreResult, StoreWriter};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::warn;

pub(crate) struct LocalReader {
    file: File,
}

impl LocalReader {
    pub(crate) const fn new(file: File) -> Self {
        Self { file }
    }
}

impl AsyncRead for LocalReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[async_trait]
impl StoreReader for LocalReader {
    async fn release(self: Box<Self>) {}
}

/// Writes into a temporary sibling of `target`; `commit` renames it into place.
pub(crate) struct LocalWriter {
    file: Option<File>,
    temp: PathBuf,
    target: PathBuf,
    finished: bool,
}

impl LocalWriter {
    pub(crate) const fn new(file: File, temp: PathBuf, target: PathBuf) -> Self {
        Self {
            file: Some(file),
            temp,
            target,
            finished: false,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already closed"))
    }
}

impl AsyncWrite for LocalWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.file() {
            Ok(file) => Pin::new(file).poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file() {
            Ok(file) => Pin::new(file).poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file() {
            Ok(file) => Pin::new(file).poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

#[async_trait]
impl StoreWriter for LocalWriter {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        let Some(mut file) = this.file.take() else {
            return Err(StoreError::io(
                "commit",
                &this.target,
                io::Error::other("writer already closed"),
            ));
        };
        file.flush()
            .await
            .map_err(|err| StoreError::io("commit.flush", &this.temp, err))?;
        file.sync_all()
            .await
            .map_err(|err| StoreError::io("commit.sync", &this.temp, err))?;
        drop(file);
        fs::rename(&this.temp, &this.target)
            .await
            .map_err(|err| StoreError::io("commit.rename", &this.target, err))?;
        this.finished = true;
        Ok(())
    }

    async fn destroy(self: Box<Self>) {
        let mut this = self;
        this.file.take();
        if let Err(err) = fs::remove_file(&this.temp).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %this.temp.display(), error = %err, "failed to remove partial upload");
        }
        this.finished = true;
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}
