//! Per-connection byte accounting with exactly-once finalization.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::stats::collector::StatsCollector;

/// Tracks one proxied connection from creation to its single close.
///
/// Close is reachable from an explicit application close or from
/// cancellation of the owning scope; both paths are safe to race, and the
/// loser is a no-op.
pub struct ConnectionTracker {
    id: i64,
    country: String,
    country_name: String,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started: Instant,
    closed: AtomicBool,
    collector: Arc<StatsCollector>,
}

impl ConnectionTracker {
    pub(crate) fn new(
        id: i64,
        country: String,
        country_name: String,
        collector: Arc<StatsCollector>,
    ) -> Self {
        Self {
            id,
            country,
            country_name,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started: Instant::now(),
            closed: AtomicBool::new(false),
            collector,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Wrap the live transport so every read/write updates the counters.
    pub fn wrap<S>(self: &Arc<Self>, inner: S) -> TrackedStream<S> {
        TrackedStream {
            inner,
            tracker: Arc::clone(self),
        }
    }

    /// Finalize the connection record. Idempotent: the compare-exchange on
    /// the closed flag lets exactly one of the competing triggers win.
    ///
    /// A persistence failure here is logged and not retried; it must never
    /// fail the proxied connection.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let bytes_in = self.bytes_in() as i64;
        let bytes_out = self.bytes_out() as i64;
        let duration = self.started.elapsed().as_secs() as i64;
        let now = chrono::Utc::now().timestamp();

        if let Err(err) = self
            .collector
            .store()
            .finalize_connection(self.id, bytes_in, bytes_out, now, duration)
            .await
        {
            warn!(id = self.id, error = %err, "Failed to persist connection close");
        }

        self.collector
            .on_tracker_closed(self.id, &self.country, &self.country_name, bytes_in, bytes_out)
            .await;

        debug!(
            id = self.id,
            duration, bytes_in, bytes_out, "Connection closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Transport wrapper counting bytes through the tracker. Reads from the
/// target count as bytes in, writes toward it as bytes out; no blocking
/// beyond the underlying I/O.
pub struct TrackedStream<S> {
    inner: S,
    tracker: Arc<ConnectionTracker>,
}

impl<S> TrackedStream<S> {
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.tracker.add_bytes_in(n as u64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.tracker.add_bytes_out(n as u64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::store::StatsStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn collector() -> Arc<StatsCollector> {
        let store = StatsStore::connect("sqlite::memory:", 1).await.unwrap();
        store.init(chrono::Utc::now().timestamp()).await.unwrap();
        StatsCollector::new(store, None, 0)
    }

    #[tokio::test]
    async fn tracked_stream_counts_both_directions() {
        let collector = collector().await;
        let tracker = collector
            .track_connection("127.0.0.1", "example.com:443")
            .await
            .expect("tracker");

        let (ours, mut theirs) = tokio::io::duplex(4096);
        let mut stream = tracker.wrap(ours);

        stream.write_all(b"hello out").await.unwrap();
        stream.flush().await.unwrap();

        theirs.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(tracker.bytes_out(), 9);
        assert_eq!(tracker.bytes_in(), 2);
    }

    #[tokio::test]
    async fn concurrent_closes_finalize_exactly_once() {
        let collector = collector().await;
        let tracker = collector
            .track_connection("127.0.0.1", "example.com:443")
            .await
            .expect("tracker");
        tracker.add_bytes_in(100);
        tracker.add_bytes_out(50);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move { t.close().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(tracker.is_closed());
        assert_eq!(collector.active_connections(), 0);

        // Server byte totals are additive, so a double finalize would
        // double them.
        let totals = collector.store().server_totals().await.unwrap();
        assert_eq!(totals.total_connections, 1);
        assert_eq!(totals.total_bytes_in, 100);
        assert_eq!(totals.total_bytes_out, 50);

        let record = collector
            .store()
            .get_connection(tracker.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.bytes_in, 100);
        assert_eq!(record.bytes_out, 50);
        assert!(record.disconnected_at.is_some());
        assert!(record.duration.is_some());
    }

    #[tokio::test]
    async fn persisted_counts_match_streamed_bytes() {
        let collector = collector().await;
        let tracker = collector
            .track_connection("127.0.0.1", "example.com:80")
            .await
            .expect("tracker");

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let mut stream = tracker.wrap(ours);

        let out = vec![0xAB; 4096];
        stream.write_all(&out).await.unwrap();

        theirs.write_all(&[0xCD; 1234]).await.unwrap();
        let mut buf = vec![0u8; 1234];
        stream.read_exact(&mut buf).await.unwrap();

        tracker.close().await;

        let record = collector
            .store()
            .get_connection(tracker.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.bytes_out, 4096);
        assert_eq!(record.bytes_in, 1234);
        // Duration is measured from creation; it should be within
        // scheduling tolerance of the elapsed wall time.
        assert!(record.duration.unwrap() <= 5);
    }
}
