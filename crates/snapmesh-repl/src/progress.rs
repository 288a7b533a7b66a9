//! Byte counting for streams in flight.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};

/// Shared counter of bytes that went through a [`ProgressReader`].
#[derive(Clone, Debug, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    /// Zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes counted so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Reader adapter that counts bytes as they are read.
pub struct ProgressReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R> ProgressReader<R> {
    /// Wraps `inner`, counting into `counter`.
    pub fn new(inner: R, counter: ByteCounter) -> Self {
        Self { inner, counter }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            self.counter.add((buf.filled().len() - before) as u64);
        }
        result
    }
}

/// Human-readable progress line.
pub fn format_progress(bytes: u64, elapsed: Duration) -> String {
    let mib = bytes as f64 / (1024.0 * 1024.0);
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { mib / secs } else { 0.0 };
    format!("transferred {mib:.2}MiB in {secs:.2}s ({rate:.2}MiB/s)...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_counts_bytes_read() {
        let counter = ByteCounter::new();
        let data = vec![7u8; 10_000];
        let mut reader = ProgressReader::new(&data[..], counter.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 10_000);
        assert_eq!(counter.get(), 10_000);
    }

    #[test]
    fn test_format_progress() {
        assert_eq!(
            format_progress(3 * 1024 * 1024, Duration::from_secs(2)),
            "transferred 3.00MiB in 2.00s (1.50MiB/s)..."
        );
        assert_eq!(
            format_progress(0, Duration::ZERO),
            "transferred 0.00MiB in 0.00s (0.00MiB/s)..."
        );
    }
}
