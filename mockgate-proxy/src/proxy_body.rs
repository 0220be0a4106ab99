//! Channel-backed streaming body with per-stream accounting.
//!
//! Each relayed call owns two of these: one carrying caller frames to the
//! backend, one carrying backend frames and trailers back to the caller.
//! The sending half lives in a relay task; dropping every sender ends the
//! body.

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

use mockgate_core::upstream::BoxError;

/// Body type of every response the proxy produces.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Capacity, in frames, of the channel between relay tasks and bodies.
pub const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    bytes_transferred: u64,
    chunks_count: u64,
    has_trailers: bool,
}

impl StreamMetrics {
    pub fn record_bytes(&mut self, count: usize) {
        self.bytes_transferred += count as u64;
        self.chunks_count += 1;
    }

    pub fn record_trailers(&mut self) {
        self.has_trailers = true;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn chunks_count(&self) -> u64 {
        self.chunks_count
    }

    pub fn has_trailers(&self) -> bool {
        self.has_trailers
    }
}

/// Sending half of a [`ProxyBody`].
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
}

impl FrameSender {
    /// Queue a data frame. `false` means the body was dropped.
    pub async fn data(&self, data: Bytes) -> bool {
        self.tx.send(Ok(Frame::data(data))).await.is_ok()
    }

    /// Queue trailers. Nothing after trailers is delivered.
    pub async fn trailers(&self, trailers: HeaderMap) -> bool {
        self.tx.send(Ok(Frame::trailers(trailers))).await.is_ok()
    }

    /// Abort the stream with an error.
    pub async fn error(&self, err: impl Into<BoxError>) -> bool {
        self.tx.send(Err(err.into())).await.is_ok()
    }

    /// True once the receiving body has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ProxyBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, BoxError>>,
    metrics: StreamMetrics,
    finished: bool,
}

/// A connected sender/body pair.
pub fn channel() -> (FrameSender, ProxyBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        FrameSender { tx },
        ProxyBody {
            rx,
            metrics: StreamMetrics::default(),
            finished: false,
        },
    )
}

impl ProxyBody {
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    fn finish(&mut self) {
        self.finished = true;
        trace!(
            bytes = self.metrics.bytes_transferred(),
            chunks = self.metrics.chunks_count(),
            trailers = self.metrics.has_trailers(),
            "Relay stream finished"
        );
    }
}

impl Body for ProxyBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.metrics.record_bytes(data.len());
                } else if frame.is_trailers() {
                    self.metrics.record_trailers();
                    self.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_forwards_data_then_trailers() {
        let (tx, body) = channel();
        tokio::spawn(async move {
            assert!(tx.data(Bytes::from_static(b"abc")).await);
            assert!(tx.data(Bytes::from_static(b"de")).await);
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", "0".parse().unwrap());
            assert!(tx.trailers(trailers).await);
        });

        let collected = body.collect().await.unwrap();
        assert_eq!(
            collected.trailers().and_then(|t| t.get("grpc-status")).unwrap(),
            "0"
        );
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn test_ends_when_senders_drop() {
        let (tx, mut body) = channel();
        let second = tx.clone();
        drop(tx);
        assert!(second.data(Bytes::from_static(b"x")).await);
        drop(second);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"x"));
        assert!(body.frame().await.is_none());
        assert!(body.is_end_stream());
        assert_eq!(body.metrics().bytes_transferred(), 1);
        assert_eq!(body.metrics().chunks_count(), 1);
    }

    #[tokio::test]
    async fn test_sender_sees_dropped_body() {
        let (tx, body) = channel();
        drop(body);
        assert!(tx.is_closed());
        assert!(!tx.data(Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn test_error_terminates_stream() {
        let (tx, mut body) = channel();
        assert!(tx.error("backend reset").await);
        assert!(body.frame().await.unwrap().is_err());
        assert!(body.frame().await.is_none());
        assert!(!body.metrics().has_trailers());
    }
}
