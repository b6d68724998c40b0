//! Stream fan-out
//!
//! [`split`] tees one byte stream into `n` identical streams so several
//! storage sinks can ingest the same bytes concurrently. Chunks are only
//! pulled from the source after every child has accepted the previous one,
//! so the slowest consumer paces the whole group.
//!
//! Failure is shared: a source error is delivered to every child, and a
//! child that stops consuming (drops its stream) aborts the source and
//! errors the remaining siblings.

use crate::UploadError;
use crate::UploadResult;
use crate::pipeline::{StorageDescriptor, StorageSink, UploadContext};
use crate::stream::{self, BoxByteStream, ChannelByteStream};
use crate::upload_error;

use std::sync::Arc;

use futures::stream::StreamExt;
use tokio::sync::mpsc;

const FANOUT_CHANNEL_CAPACITY: usize = 4;

/// Splits `source` into `n` independent streams carrying the same bytes.
///
/// # Panics
/// Panics if `n` is zero.
#[must_use]
pub fn split(source: BoxByteStream, n: usize) -> Vec<ChannelByteStream> {
    assert!(n > 0, "split requires at least one consumer");

    let mut senders = Vec::with_capacity(n);
    let mut children = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);
        senders.push(tx);
        children.push(ChannelByteStream::new(rx));
    }

    tokio::spawn(drive(source, senders));
    children
}

/// Feeds `source` to every sink concurrently, each with its own forked
/// context. Descriptors come back in sink order. Any sink's failure is
/// the whole group's failure: remaining branches are dropped, which
/// aborts the source through [`split`]'s shared-failure rule.
///
/// # Errors
/// The first sink failure.
pub async fn execute_parallel(
    source: BoxByteStream,
    sinks: &[Arc<dyn StorageSink>],
    ctx: &UploadContext,
) -> UploadResult<Vec<StorageDescriptor>> {
    let branches = split(source, sinks.len());
    let tasks = sinks.iter().zip(branches).map(|(sink, branch)| {
        let sink = Arc::clone(sink);
        let mut branch_ctx = ctx.fork(stream::boxed(branch));
        async move { sink.store(&mut branch_ctx).await }
    });
    futures::future::try_join_all(tasks).await
}

async fn drive(mut source: BoxByteStream, senders: Vec<mpsc::Sender<Result<bytes::Bytes, UploadError>>>) {
    loop {
        match source.next().await {
            None => break,
            Some(Ok(bytes)) => {
                let mut lost_child = false;
                for tx in &senders {
                    if tx.send(Ok(bytes.clone())).await.is_err() {
                        lost_child = true;
                    }
                }
                if lost_child {
                    tracing::debug!("fan-out consumer went away, aborting siblings");
                    let err = upload_error!(StorageWriteFailed, "fan-out aborted: a sibling consumer failed");
                    for tx in &senders {
                        let _ = tx.send(Err(err.replicate())).await;
                    }
                    break;
                }
            }
            Some(Err(err)) => {
                for tx in &senders {
                    let _ = tx.send(Err(err.replicate())).await;
                }
                break;
            }
        }
    }
    // dropping the senders closes every child; dropping the source
    // releases the upstream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;

    use bytes::Bytes;

    async fn drain(s: ChannelByteStream) -> Result<Vec<u8>, UploadError> {
        let chunks = stream::collect_limited(stream::boxed(s), 1 << 20).await?;
        Ok(chunks.iter().flat_map(|b| b.iter().copied()).collect())
    }

    #[tokio::test]
    async fn all_children_see_all_bytes() {
        let source = stream::iter(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        let children = split(source, 3);
        let mut outputs = Vec::new();
        for child in children {
            outputs.push(drain(child).await.unwrap());
        }
        for output in outputs {
            assert_eq!(output, b"onetwo");
        }
    }

    #[tokio::test]
    async fn source_error_reaches_every_child() {
        let source = stream::boxed(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data")),
            Err(upload_error!(UnexpectedEnd, "body died")),
        ]));
        let children = split(source, 2);
        for child in children {
            let err = drain(child).await.unwrap_err();
            assert_eq!(err.code(), crate::UploadErrorCode::UnexpectedEnd);
        }
    }

    #[tokio::test]
    async fn dropped_child_aborts_siblings() {
        // an endless source: the driver must stop because of the dropped
        // child, not because input ran out
        let source = stream::boxed(futures::stream::repeat(Bytes::from_static(b"chunk")).map(Ok));
        let mut children = split(source, 2);
        let survivor = children.pop().unwrap();
        drop(children.pop().unwrap());

        let err = drain(survivor).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::StorageWriteFailed);
    }
}
