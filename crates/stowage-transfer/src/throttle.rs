//! Token-bucket rate limiting for async byte channels.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use stowage_transfer_core::{RateConfig, StoreReader, TransferResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{self, Instant, Sleep};

const NANOS_PER_SEC: u128 = 1_000_000_000;
/// The bucket holds one tenth of a second worth of tokens.
const BURST_DIVISOR: u64 = 10;

#[derive(Debug)]
struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: u64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(rate: RateConfig) -> Self {
        let rate = rate.bytes_per_second();
        let capacity = (rate / BURST_DIVISOR).max(1);
        Self {
            rate,
            capacity,
            tokens: capacity,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_nanos();
        let earned = elapsed * u128::from(self.rate) / NANOS_PER_SEC;
        if earned == 0 {
            return;
        }
        let room = u128::from(self.capacity - self.tokens);
        if earned >= room {
            self.tokens = self.capacity;
            self.refilled_at = now;
            return;
        }
        // Keep the fractional remainder so slow rates do not drift.
        self.tokens += u64::try_from(earned).unwrap_or(0);
        let spent = earned * NANOS_PER_SEC / u128::from(self.rate);
        self.refilled_at += Duration::from_nanos(u64::try_from(spent).unwrap_or(u64::MAX));
    }

    fn next_token_at(&self) -> Instant {
        let per_token = NANOS_PER_SEC.div_ceil(u128::from(self.rate));
        self.refilled_at + Duration::from_nanos(u64::try_from(per_token).unwrap_or(u64::MAX))
    }

    fn take(&mut self, used: usize) {
        self.tokens = self
            .tokens
            .saturating_sub(u64::try_from(used).unwrap_or(u64::MAX));
    }
}

/// Rate-limited wrapper around an [`AsyncRead`] or [`AsyncWrite`] resource.
///
/// Reads and writes are clamped to the tokens currently in the bucket. When
/// the bucket is empty the task parks on a timer until a token is available.
/// The first error from the wrapped resource latches the channel: the resource
/// is dropped on the spot, releasing it, and every later poll fails with the
/// same error kind. Dropping the channel drops the wrapped resource.
#[derive(Debug)]
pub struct Throttled<T> {
    inner: Option<T>,
    bucket: TokenBucket,
    sleep: Option<Pin<Box<Sleep>>>,
    failure: Option<(io::ErrorKind, String)>,
}

impl<T> Throttled<T> {
    /// Wrap `inner`, limiting it to `rate`.
    pub fn new(inner: T, rate: RateConfig) -> Self {
        Self {
            inner: Some(inner),
            bucket: TokenBucket::new(rate),
            sleep: None,
            failure: None,
        }
    }

    /// Wrap `inner` with a raw bytes-per-second figure.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` when `bytes_per_second` is zero.
    pub fn with_rate(inner: T, bytes_per_second: u64) -> TransferResult<Self> {
        Ok(Self::new(inner, RateConfig::new(bytes_per_second)?))
    }

    /// Configured throughput.
    pub const fn bytes_per_second(&self) -> u64 {
        self.bucket.rate
    }

    /// Whether an error has latched the channel.
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Borrow the wrapped resource; `None` once an error released it.
    pub const fn get_ref(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    /// Hand back the wrapped resource; `None` once an error released it.
    pub fn into_inner(self) -> Option<T> {
        self.inner
    }

    fn latched(&self) -> Option<io::Error> {
        self.failure
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }

    fn live(&mut self) -> io::Result<&mut T> {
        let failure = self.latched();
        self.inner
            .as_mut()
            .ok_or_else(|| failure.unwrap_or_else(|| io::Error::other("channel released")))
    }

    fn observe<V>(&mut self, polled: Poll<io::Result<V>>) -> Poll<io::Result<V>> {
        if let Poll::Ready(Err(err)) = &polled {
            self.failure = Some((err.kind(), err.to_string()));
            self.inner = None;
        }
        polled
    }

    fn poll_allowance(&mut self, cx: &mut Context<'_>) -> Poll<u64> {
        loop {
            if let Some(sleep) = self.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
            }
            self.bucket.refill(Instant::now());
            if self.bucket.tokens > 0 {
                return Poll::Ready(self.bucket.tokens);
            }
            self.sleep = Some(Box::pin(time::sleep_until(self.bucket.next_token_at())));
        }
    }
}

impl Throttled<Box<dyn StoreReader>> {
    /// Stop the transfer and release the store resource, unless an error
    /// already released it.
    pub async fn abort(self) {
        if let Some(inner) = self.inner {
            inner.release().await;
        }
    }
}

fn clamp(allowance: u64, wanted: usize) -> usize {
    usize::try_from(allowance).unwrap_or(usize::MAX).min(wanted)
}

impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.latched() {
            return Poll::Ready(Err(err));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let allowance = ready!(this.poll_allowance(cx));
        let inner = match this.live() {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Err(err)),
        };
        let window = buf.initialize_unfilled_to(clamp(allowance, buf.remaining()));
        let mut limited = ReadBuf::new(window);
        let polled = Pin::new(inner).poll_read(cx, &mut limited);
        let read = limited.filled().len();
        if let Poll::Ready(Ok(())) = polled {
            buf.advance(read);
            this.bucket.take(read);
        }
        this.observe(polled)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.latched() {
            return Poll::Ready(Err(err));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let allowance = ready!(this.poll_allowance(cx));
        let limit = clamp(allowance, buf.len());
        let inner = match this.live() {
            Ok(inner) => inner,
            Err(err) => return Poll::Ready(Err(err)),
        };
        let polled = Pin::new(inner).poll_write(cx, &buf[..limit]);
        if let Poll::Ready(Ok(written)) = polled {
            this.bucket.take(written);
        }
        this.observe(polled)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = match this.live() {
            Ok(inner) => Pin::new(inner).poll_flush(cx),
            Err(err) => return Poll::Ready(Err(err)),
        };
        this.observe(polled)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = match this.live() {
            Ok(inner) => Pin::new(inner).poll_shutdown(cx),
            Err(err) => return Poll::Ready(Err(err)),
        };
        this.observe(polled)
    }
}
