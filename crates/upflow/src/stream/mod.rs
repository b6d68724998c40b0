//! Byte stream utilities
//!
//! Every stream flowing through the engine is a `Stream` of
//! `Result<Bytes, UploadError>`. A stream is "destroyed" by dropping it;
//! a destroyed upstream surfaces as a terminal `Err` item downstream.

pub mod multiplex;

use crate::UploadError;
use crate::UploadResult;
use crate::upload_error;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Boxed byte stream used at plugin seams.
pub type BoxByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UploadError>> + Send + Sync + 'static>>;

/// Boxed request body stream, as handed in by the HTTP layer.
pub type BoxBodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, crate::StdError>> + Send + 'static>>;

/// Boxes a concrete stream.
pub fn boxed<S>(stream: S) -> BoxByteStream
where
    S: Stream<Item = Result<Bytes, UploadError>> + Send + Sync + 'static,
{
    Box::pin(stream)
}

/// A stream yielding a single chunk.
pub fn once(bytes: Bytes) -> BoxByteStream {
    boxed(futures::stream::iter([Ok(bytes)]))
}

/// A stream yielding the given chunks in order.
pub fn iter(chunks: Vec<Bytes>) -> BoxByteStream {
    boxed(futures::stream::iter(chunks.into_iter().map(Ok)))
}

/// An empty stream.
pub fn empty() -> BoxByteStream {
    boxed(futures::stream::empty())
}

/// Chains already-read chunks back in front of the remaining stream.
///
/// This is the replay half of peek-then-replay validators.
pub fn replay(prefix: Vec<Bytes>, rest: BoxByteStream) -> BoxByteStream {
    if prefix.is_empty() {
        return rest;
    }
    boxed(futures::stream::iter(prefix.into_iter().map(Ok)).chain(rest))
}

/// Reads chunks until at least `n` bytes are buffered (or the stream ends),
/// then returns the buffered prefix and an equivalent full stream.
pub async fn peek_prefix(mut stream: BoxByteStream, n: usize) -> UploadResult<(Bytes, BoxByteStream)> {
    let mut chunks = Vec::new();
    let mut have = 0;
    while have < n {
        match stream.next().await {
            None => break,
            Some(Err(e)) => return Err(e),
            Some(Ok(bytes)) => {
                have += bytes.len();
                chunks.push(bytes);
            }
        }
    }
    let mut prefix = BytesMut::with_capacity(have.min(n));
    for chunk in &chunks {
        let want = n.saturating_sub(prefix.len());
        if want == 0 {
            break;
        }
        prefix.extend_from_slice(&chunk[..chunk.len().min(want)]);
    }
    Ok((prefix.freeze(), replay(chunks, stream)))
}

/// Collects a stream into chunks, failing once `max_size` is exceeded.
pub async fn collect_limited(mut stream: BoxByteStream, max_size: u64) -> UploadResult<Vec<Bytes>> {
    let mut chunks = Vec::new();
    let mut total: u64 = 0;
    while let Some(item) = stream.next().await {
        let bytes = item?;
        total = total.saturating_add(bytes.len() as u64);
        if total > max_size {
            return Err(upload_error!(LimitExceeded, "stream exceeds {} bytes", max_size));
        }
        chunks.push(bytes);
    }
    Ok(chunks)
}

/// Receiver half of a bounded byte channel, exposed as a stream.
///
/// Dropping the receiver closes the channel; the producer observes the
/// closed channel and stops, which is how consumers cancel upstream work.
pub struct ChannelByteStream {
    rx: mpsc::Receiver<Result<Bytes, UploadError>>,
}

impl ChannelByteStream {
    #[must_use]
    pub(crate) fn new(rx: mpsc::Receiver<Result<Bytes, UploadError>>) -> Self {
        Self { rx }
    }
}

impl std::fmt::Debug for ChannelByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelByteStream").finish_non_exhaustive()
    }
}

impl Stream for ChannelByteStream {
    type Item = Result<Bytes, UploadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

pin_project_lite::pin_project! {
    /// Pass-through stream that counts the bytes it forwards.
    pub struct CountingStream<S> {
        #[pin]
        inner: S,
        counter: Arc<AtomicU64>,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, UploadError>>,
{
    type Item = Result<Bytes, UploadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = poll {
            this.counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peek_then_replay_preserves_bytes() {
        let source = iter(vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo"), Bytes::from_static(b" world")]);
        let (prefix, full) = peek_prefix(source, 4).await.unwrap();
        assert_eq!(&prefix[..], b"hell");

        let chunks = collect_limited(full, 1024).await.unwrap();
        let all: Vec<u8> = chunks.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(all, b"hello world");
    }

    #[tokio::test]
    async fn peek_short_stream() {
        let (prefix, full) = peek_prefix(once(Bytes::from_static(b"ab")), 16).await.unwrap();
        assert_eq!(&prefix[..], b"ab");
        let chunks = collect_limited(full, 1024).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn collect_limited_rejects_overflow() {
        let source = iter(vec![Bytes::from_static(b"aaaa"), Bytes::from_static(b"bbbb")]);
        let err = collect_limited(source, 6).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::LimitExceeded);
    }

    #[tokio::test]
    async fn counting_stream_counts() {
        let counter = Arc::new(AtomicU64::new(0));
        let counted = CountingStream::new(iter(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]), counter.clone());
        let _ = collect_limited(boxed(counted), 1024).await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }
}
