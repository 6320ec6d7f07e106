//! Byte-counting decorator for transfer bodies

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::progress::ProgressReporter;

/// Wraps a reader or writer and counts the bytes passing through it.
///
/// A progress line is emitted at most once per `interval`, and once more
/// when the stream reaches EOF or is shut down.
pub struct ProgressStream<S> {
    inner: S,
    name: String,
    total: u64,
    transferred: u64,
    started: Instant,
    last_report: Option<Instant>,
    interval: Duration,
    reporter: Option<ProgressReporter>,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, name: impl Into<String>, total: u64, interval: Duration) -> Self {
        Self {
            inner,
            name: name.into(),
            total,
            transferred: 0,
            started: Instant::now(),
            last_report: None,
            interval,
            reporter: None,
        }
    }

    /// Also forward progress as [`ProgressEvent::TransferProgress`](crate::progress::ProgressEvent::TransferProgress)
    pub fn with_reporter(mut self, reporter: Option<ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn record(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
        let now = Instant::now();
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.report(now);
        }
    }

    fn finish(&mut self) {
        if self.last_report.is_none() || self.transferred > 0 {
            self.report(Instant::now());
        }
    }

    fn report(&mut self, now: Instant) {
        self.last_report = Some(now);
        let elapsed = now.duration_since(self.started);
        let rate = if elapsed.as_secs_f64() > 0.0 {
            (self.transferred as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        let percent = if self.total > 0 {
            self.transferred.saturating_mul(100) / self.total
        } else {
            100
        };

        debug!(
            "Progress: {}b {}b/s {}% ({})",
            self.transferred, rate, percent, self.name
        );
        if let Some(reporter) = &self.reporter {
            // A closed progress channel must not fail the transfer
            let _ = reporter.transfer_progress(&self.name, self.transferred, self.total, elapsed);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProgressStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            if read == 0 {
                this.finish();
            } else {
                this.record(read);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProgressStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.record(*written);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &poll {
            this.finish();
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressChannel, ProgressEvent};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_counts_bytes_read() {
        let data = vec![7u8; 20_000];
        let mut stream = ProgressStream::new(&data[..], "blob", data.len() as u64, Duration::from_secs(60));

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(stream.transferred(), 20_000);
    }

    #[tokio::test]
    async fn test_counts_bytes_written() {
        let mut stream = ProgressStream::new(Vec::new(), "blob", 11, Duration::from_secs(60));
        stream.write_all(b"hello ").await.unwrap();
        stream.write_all(b"world").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(stream.transferred(), 11);
        assert_eq!(stream.into_inner(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_reports_are_rate_limited() {
        let (reporter, mut channel) = ProgressChannel::new(Uuid::new_v4());
        let data = vec![1u8; 4096];
        let mut stream = ProgressStream::new(&data[..], "blob", 4096, Duration::from_secs(3600))
            .with_reporter(Some(reporter));

        let mut chunk = [0u8; 512];
        while stream.read(&mut chunk).await.unwrap() > 0 {}

        // First chunk, then the final report at EOF
        let mut reports = Vec::new();
        while let Ok(event) = channel.try_recv() {
            if let ProgressEvent::TransferProgress { bytes_transferred, .. } = event {
                reports.push(bytes_transferred);
            }
        }
        assert_eq!(reports, vec![512, 4096]);
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_fail_transfer() {
        let (reporter, channel) = ProgressChannel::new(Uuid::new_v4());
        drop(channel);

        let mut stream = ProgressStream::new(&b"abc"[..], "x", 3, Duration::ZERO).with_reporter(Some(reporter));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
    }
}
