//! Stream capture (§4.4, C6): a "tee writer" over an upstream body stream. Every chunk
//! is forwarded to the client unconditionally; the same chunk is also appended to an
//! internal buffer as long as doing so would not exceed `max_object_bytes`. Capture
//! failure (overflow) never affects the forwarded bytes -- it only disqualifies the
//! response from being handed to the HTTP cache (C5).

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome of a capture, sent once the wrapped stream ends.
#[derive(Clone, Debug)]
pub enum CaptureOutcome {
    /// Every byte forwarded to the client was also retained; safe to `Set` in the cache.
    Complete(Bytes),
    /// The stream exceeded `max_object_bytes` before finishing; not cacheable.
    Overflowed,
    /// The upstream stream itself errored; nothing useful was captured.
    UpstreamError,
}

/// Wraps a `Stream<Item = reqwest::Result<Bytes>>` (or any compatible byte stream),
/// forwarding every item to its own `Stream` consumer while mirroring bytes into an
/// internal buffer up to `max_object_bytes`. Call `outcome_receiver` once, before
/// polling starts, to get the channel that fires when the wrapped stream ends.
pub struct CapturingStream<S> {
    inner: S,
    buffer: Option<Vec<u8>>,
    max_object_bytes: usize,
    overflowed: bool,
    errored: bool,
    outcome_tx: Option<oneshot::Sender<CaptureOutcome>>,
}

impl<S, E> CapturingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S, max_object_bytes: usize) -> (Self, oneshot::Receiver<CaptureOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            CapturingStream {
                inner,
                buffer: Some(Vec::new()),
                max_object_bytes,
                overflowed: false,
                errored: false,
                outcome_tx: Some(tx),
            },
            rx,
        )
    }

    fn finish(&mut self) {
        let Some(tx) = self.outcome_tx.take() else {
            return;
        };
        let outcome = if self.errored {
            CaptureOutcome::UpstreamError
        } else if self.overflowed {
            CaptureOutcome::Overflowed
        } else {
            let bytes = self.buffer.take().unwrap_or_default();
            CaptureOutcome::Complete(Bytes::from(bytes))
        };
        // The receiver may already have been dropped (pipeline bailed early); that's
        // fine, the capture result just goes unused.
        let _ = tx.send(outcome);
    }
}

impl<S, E> Stream for CapturingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(chunk))) => {
                if !self.overflowed {
                    if let Some(buffer) = self.buffer.as_mut() {
                        if buffer.len() + chunk.len() <= self.max_object_bytes {
                            buffer.extend_from_slice(chunk);
                        } else {
                            self.overflowed = true;
                            self.buffer = None;
                        }
                    }
                }
            }
            Poll::Ready(Some(Err(_))) => {
                self.errored = true;
            }
            Poll::Ready(None) => {
                self.finish();
            }
            Poll::Pending => {}
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    type ChunkResult = Result<Bytes, std::io::Error>;

    #[tokio::test]
    async fn captures_every_chunk_when_under_the_cap() {
        let chunks: Vec<ChunkResult> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let (mut capturing, outcome_rx) = CapturingStream::new(stream::iter(chunks), 1024);

        let mut forwarded = Vec::new();
        while let Some(item) = futures_util::StreamExt::next(&mut capturing).await {
            forwarded.extend_from_slice(&item.unwrap());
        }
        assert_eq!(forwarded, b"hello world");

        match outcome_rx.await.unwrap() {
            CaptureOutcome::Complete(bytes) => assert_eq!(bytes.as_ref(), b"hello world"),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_disqualifies_capture_but_still_forwards_all_bytes() {
        let chunks: Vec<ChunkResult> = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ];
        let (mut capturing, outcome_rx) = CapturingStream::new(stream::iter(chunks), 15);

        let mut forwarded = Vec::new();
        while let Some(item) = futures_util::StreamExt::next(&mut capturing).await {
            forwarded.extend_from_slice(&item.unwrap());
        }
        assert_eq!(forwarded.len(), 20);

        match outcome_rx.await.unwrap() {
            CaptureOutcome::Overflowed => {}
            other => panic!("expected Overflowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_error_is_reported_but_does_not_panic() {
        let chunks: Vec<ChunkResult> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ];
        let (mut capturing, outcome_rx) = CapturingStream::new(stream::iter(chunks), 1024);

        let mut saw_error = false;
        while let Some(item) = futures_util::StreamExt::next(&mut capturing).await {
            if item.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);

        match outcome_rx.await.unwrap() {
            CaptureOutcome::UpstreamError => {}
            other => panic!("expected UpstreamError, got {other:?}"),
        }
    }
}
