//! Direct upload and download paths between clients and the file store.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use stowage_events::{Event, EventBus};
use stowage_telemetry::Metrics;
use stowage_transfer_core::{
    FileStore, RateConfig, SourceChunk, StoreReader, StoreWriter, TransferError,
    TransferOutcome, TransferResult, UploadSource,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::throttle::Throttled;

/// Read size used by [`ReaderSource`].
const SOURCE_CHUNK_BYTES: usize = 64 * 1024;

/// How the upload pump stopped.
enum Pumped {
    Clean,
    ShortOrCut { received: u64 },
    Overrun { received: u64 },
    Broken(io::Error),
}

/// Throttled, quota-aware transfers between a client and the file store.
pub struct ClientTransfer {
    store: Arc<dyn FileStore>,
    default_rate: RateConfig,
    events: EventBus,
    metrics: Metrics,
}

impl ClientTransfer {
    /// Build the service over a file store.
    pub fn new(
        store: Arc<dyn FileStore>,
        default_rate: RateConfig,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            default_rate,
            events,
            metrics,
        }
    }

    /// Open `path` for `owner` as a rate-limited byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] or [`TransferError::PermissionDenied`]
    /// when the store refuses the read, and [`TransferError::Io`] on
    /// filesystem failures.
    pub async fn download(
        &self,
        owner: &str,
        path: &str,
        rate: Option<RateConfig>,
    ) -> TransferResult<Throttled<Box<dyn StoreReader>>> {
        let rate = rate.unwrap_or(self.default_rate);
        let reader = self.store.readable(owner, path).await.map_err(|err| {
            debug!(owner, path, error = %err, "download refused");
            TransferError::from_store(owner, path, err)
        })?;
        self.metrics.inc_download_started();
        info!(
            owner,
            path,
            bytes_per_second = rate.bytes_per_second(),
            "download started"
        );
        Ok(Throttled::new(reader, rate))
    }

    /// Stream `source` into the store at `file_name` for `owner`.
    ///
    /// Returns once the source has ended or failed and the stored file has
    /// been committed or destroyed. The source is never polled when the
    /// store refuses the write.
    pub async fn upload<S: UploadSource>(
        &self,
        owner: &str,
        file_name: &str,
        mut source: S,
        declared_size: u64,
        rate: Option<RateConfig>,
    ) -> TransferOutcome {
        let rate = rate.unwrap_or(self.default_rate);
        let writer = match self.store.writable(owner, file_name, declared_size).await {
            Ok(writer) => writer,
            Err(err) => {
                warn!(owner, path = file_name, error = %err, "upload refused by store");
                drop(source);
                return self.finish(owner, file_name, TransferOutcome::denied());
            }
        };

        let mut sink = Throttled::new(writer, rate);
        let mut received: u64 = 0;
        let pumped = loop {
            match source.next_chunk().await {
                Ok(SourceChunk::Data(bytes)) => {
                    received =
                        received.saturating_add(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
                    if received > declared_size {
                        break Pumped::Overrun { received };
                    }
                    if let Err(err) = sink.write_all(&bytes).await {
                        break Pumped::Broken(err);
                    }
                }
                Ok(SourceChunk::EndOfInput { truncated }) => {
                    if truncated || received < declared_size {
                        break Pumped::ShortOrCut { received };
                    }
                    break match sink.flush().await {
                        Ok(()) => Pumped::Clean,
                        Err(err) => Pumped::Broken(err),
                    };
                }
                Err(err) => break Pumped::Broken(err),
            }
        };
        drop(source);

        let outcome = match (pumped, sink.into_inner()) {
            (Pumped::Clean, Some(writer)) => match writer.commit().await {
                Ok(()) => TransferOutcome::completed(),
                Err(err) => {
                    warn!(owner, path = file_name, error = %err, "upload commit failed");
                    TransferOutcome::failed()
                }
            },
            (Pumped::ShortOrCut { received } | Pumped::Overrun { received }, writer) => {
                let cause = TransferError::TruncatedTransfer {
                    expected: declared_size,
                    received,
                };
                warn!(owner, path = file_name, error = %cause, received, declared_size, "upload truncated");
                discard(writer).await;
                TransferOutcome::truncated()
            }
            (Pumped::Broken(err), writer) => {
                let cause = TransferError::io("upload.pump", err);
                warn!(owner, path = file_name, error = %cause, "upload failed");
                discard(writer).await;
                TransferOutcome::failed()
            }
            // The sink latched an error and already dropped its writer.
            (Pumped::Clean, None) => TransferOutcome::failed(),
        };
        self.finish(owner, file_name, outcome)
    }

    fn finish(&self, owner: &str, path: &str, outcome: TransferOutcome) -> TransferOutcome {
        self.metrics.inc_upload(outcome.label());
        self.events.publish(Event::UploadFinished {
            owner_id: owner.to_string(),
            path: path.to_string(),
            success: outcome.success(),
            limit_reached: outcome.limit_reached(),
        });
        info!(owner, path, outcome = outcome.label(), "upload finished");
        outcome
    }
}

/// Destroy a writer the sink still holds; a latched sink released its own.
async fn discard(writer: Option<Box<dyn StoreWriter>>) {
    if let Some(writer) = writer {
        writer.destroy().await;
    }
}

/// [`UploadSource`] over any async reader with a known length.
///
/// End of input before `declared` bytes is reported as truncated.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    declared: u64,
    received: u64,
}

impl<R> ReaderSource<R> {
    /// Adapt `reader`, which is expected to yield `declared` bytes.
    pub const fn new(reader: R, declared: u64) -> Self {
        Self {
            reader,
            declared,
            received: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> UploadSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> io::Result<SourceChunk> {
        let mut buf = vec![0_u8; SOURCE_CHUNK_BYTES];
        let read = self.reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(SourceChunk::EndOfInput {
                truncated: self.received < self.declared,
            });
        }
        buf.truncate(read);
        self.received = self
            .received
            .saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
        Ok(SourceChunk::Data(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stowage_test_support::mocks::{MemoryFileStore, StoreFaults};

    struct ScriptedSource {
        chunks: VecDeque<io::Result<SourceChunk>>,
        polls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<io::Result<SourceChunk>>) -> (Self, Arc<AtomicUsize>) {
            let polls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    chunks: chunks.into(),
                    polls: Arc::clone(&polls),
                },
                polls,
            )
        }
    }

    #[async_trait]
    impl UploadSource for ScriptedSource {
        async fn next_chunk(&mut self) -> io::Result<SourceChunk> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.chunks
                .pop_front()
                .unwrap_or(Ok(SourceChunk::EndOfInput { truncated: false }))
        }
    }

    fn data(bytes: &[u8]) -> io::Result<SourceChunk> {
        Ok(SourceChunk::Data(bytes.to_vec()))
    }

    fn end(truncated: bool) -> io::Result<SourceChunk> {
        Ok(SourceChunk::EndOfInput { truncated })
    }

    fn service(store: &Arc<MemoryFileStore>) -> anyhow::Result<(ClientTransfer, EventBus)> {
        let events = EventBus::new();
        let transfer = ClientTransfer::new(
            Arc::clone(store) as Arc<dyn FileStore>,
            RateConfig::default(),
            events.clone(),
            Metrics::new()?,
        );
        Ok((transfer, events))
    }

    #[tokio::test]
    async fn clean_upload_commits_the_file() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, events) = service(&store)?;
        let mut stream = events.subscribe(None);
        let (source, _) = ScriptedSource::new(vec![data(b"hello "), data(b"world"), end(false)]);

        let outcome = transfer.upload("alice", "/greeting.txt", source, 11, None).await;

        assert_eq!(outcome, TransferOutcome::completed());
        assert_eq!(store.get("alice", "/greeting.txt"), Some(b"hello world".to_vec()));
        let event = stream.next().await.map(|envelope| envelope.event);
        assert!(matches!(
            event,
            Some(Event::UploadFinished { success: true, limit_reached: false, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn denied_upload_never_polls_the_source() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        store.set_faults(StoreFaults {
            deny_writes: true,
            ..StoreFaults::default()
        });
        let (transfer, _) = service(&store)?;
        let (source, polls) = ScriptedSource::new(vec![data(b"x"), end(false)]);

        let outcome = transfer.upload("alice", "/x.bin", source, 1, None).await;

        assert_eq!(outcome, TransferOutcome::denied());
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cut_off_client_destroys_the_partial_file() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;
        let (source, _) = ScriptedSource::new(vec![data(&[0_u8; 400]), end(true)]);

        let outcome = transfer.upload("alice", "/big.bin", source, 1_000, None).await;

        assert_eq!(outcome, TransferOutcome::truncated());
        assert!(outcome.permission_granted());
        assert_eq!(store.get("alice", "/big.bin"), None);
        assert_eq!(store.destroyed_writes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn short_clean_end_counts_as_truncation() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;
        let (source, _) = ScriptedSource::new(vec![data(b"abc"), end(false)]);

        let outcome = transfer.upload("alice", "/short.bin", source, 10, None).await;

        assert_eq!(outcome, TransferOutcome::truncated());
        assert_eq!(store.destroyed_writes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_upload_is_capped() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;
        let (source, _) = ScriptedSource::new(vec![data(b"abcd"), data(b"efgh"), end(false)]);

        let outcome = transfer.upload("alice", "/cap.bin", source, 6, None).await;

        assert_eq!(outcome, TransferOutcome::truncated());
        assert_eq!(store.get("alice", "/cap.bin"), None);
        Ok(())
    }

    #[tokio::test]
    async fn source_errors_fail_and_destroy() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;
        let (source, _) = ScriptedSource::new(vec![
            data(b"abc"),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client reset")),
        ]);

        let outcome = transfer.upload("alice", "/err.bin", source, 10, None).await;

        assert_eq!(outcome, TransferOutcome::failed());
        assert_eq!(store.destroyed_writes(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn sink_and_commit_failures_fail_the_upload() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;

        store.set_faults(StoreFaults {
            fail_write_after: Some(2),
            ..StoreFaults::default()
        });
        let (source, _) = ScriptedSource::new(vec![data(b"abcd"), end(false)]);
        let outcome = transfer.upload("alice", "/w.bin", source, 4, None).await;
        assert_eq!(outcome, TransferOutcome::failed());

        store.set_faults(StoreFaults {
            fail_commit: true,
            ..StoreFaults::default()
        });
        let (source, _) = ScriptedSource::new(vec![data(b"abcd"), end(false)]);
        let outcome = transfer.upload("alice", "/c.bin", source, 4, None).await;
        assert_eq!(outcome, TransferOutcome::failed());
        assert_eq!(store.get("alice", "/c.bin"), None);
        Ok(())
    }

    #[tokio::test]
    async fn reader_sources_report_truncation() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        let (transfer, _) = service(&store)?;

        let full = ReaderSource::new(&b"exactly"[..], 7);
        let outcome = transfer.upload("alice", "/full.txt", full, 7, None).await;
        assert_eq!(outcome, TransferOutcome::completed());

        let short = ReaderSource::new(&b"half"[..], 8);
        let outcome = transfer.upload("alice", "/short.txt", short, 8, None).await;
        assert_eq!(outcome, TransferOutcome::truncated());
        Ok(())
    }

    #[tokio::test]
    async fn download_streams_and_maps_errors() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        store.put("alice", "/doc.txt", b"contents".to_vec());
        let (transfer, _) = service(&store)?;

        let mut channel = transfer.download("alice", "/doc.txt", None).await?;
        let mut contents = Vec::new();
        channel.read_to_end(&mut contents).await?;
        assert_eq!(contents, b"contents");

        assert!(matches!(
            transfer.download("bob", "/doc.txt", None).await,
            Err(TransferError::NotFound { .. })
        ));
        store.set_faults(StoreFaults {
            deny_reads: true,
            ..StoreFaults::default()
        });
        assert!(matches!(
            transfer.download("alice", "/doc.txt", None).await,
            Err(TransferError::PermissionDenied { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failing_reader_is_released_without_an_abort() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        store.put("alice", "/doc.txt", vec![1_u8; 64]);
        store.set_faults(StoreFaults {
            fail_reads: true,
            ..StoreFaults::default()
        });
        let (transfer, _) = service(&store)?;

        let mut channel = transfer.download("alice", "/doc.txt", None).await?;
        let mut buf = [0_u8; 16];
        assert!(channel.read(&mut buf).await.is_err());
        assert!(channel.is_failed());
        assert_eq!(store.released_reads(), 1);

        channel.abort().await;
        assert_eq!(store.released_reads(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn aborted_downloads_release_the_reader() -> anyhow::Result<()> {
        let store = Arc::new(MemoryFileStore::new());
        store.put("alice", "/doc.txt", vec![1_u8; 64]);
        let (transfer, _) = service(&store)?;

        let channel = transfer.download("alice", "/doc.txt", None).await?;
        channel.abort().await;
        assert_eq!(store.released_reads(), 1);
        Ok(())
    }
}
