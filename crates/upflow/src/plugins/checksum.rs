//! Checksum transformer
//!
//! Wraps the stream in a pass-through digest. The hash only exists once
//! the sink has drained the stream, so it is delivered through a metadata
//! finalizer (`hash` and `hash_algorithm` keys).

use crate::UploadError;
use crate::UploadResult;
use crate::crypto::{self, Checksum, Md5, Sha1, Sha256};
use crate::pipeline::{Plugin, Transformer, UploadContext};
use crate::stream::{self, BoxByteStream};
use crate::upload_error;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

type HashSlot = Arc<Mutex<Option<String>>>;

pin_project_lite::pin_project! {
    struct DigestStream<D>
    where
        D: Checksum,
    {
        #[pin]
        inner: BoxByteStream,
        digest: Option<D>,
        slot: HashSlot,
    }
}

impl<D: Checksum> Stream for DigestStream<D> {
    type Item = Result<Bytes, UploadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = this.inner.poll_next(cx);
        match &poll {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(digest) = this.digest.as_mut() {
                    digest.update(bytes);
                }
            }
            Poll::Ready(None) => {
                if let Some(digest) = this.digest.take() {
                    *this.slot.lock().unwrap() = Some(crypto::hex(digest.finalize()));
                }
            }
            _ => {}
        }
        poll
    }
}

fn wrap<D>(input: BoxByteStream, slot: HashSlot) -> BoxByteStream
where
    D: Checksum + Send + Sync + 'static,
{
    stream::boxed(DigestStream {
        inner: input,
        digest: Some(D::new()),
        slot,
    })
}

/// Transformer recording a content digest of the bytes that reach the sink.
pub struct ChecksumTransformer {
    algorithm: HashAlgorithm,
}

impl ChecksumTransformer {
    #[must_use]
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }
}

impl Default for ChecksumTransformer {
    fn default() -> Self {
        Self::new(HashAlgorithm::Sha256)
    }
}

impl Plugin for ChecksumTransformer {
    fn name(&self) -> &'static str {
        "checksum"
    }
}

#[async_trait::async_trait]
impl Transformer for ChecksumTransformer {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()> {
        let input = ctx
            .take_stream()
            .ok_or_else(|| upload_error!(PluginMisbehavior, "checksum transformer has no stream"))?;
        let slot: HashSlot = Arc::new(Mutex::new(None));
        let wrapped = match self.algorithm {
            HashAlgorithm::Md5 => wrap::<Md5>(input, Arc::clone(&slot)),
            HashAlgorithm::Sha1 => wrap::<Sha1>(input, Arc::clone(&slot)),
            HashAlgorithm::Sha256 => wrap::<Sha256>(input, Arc::clone(&slot)),
        };
        ctx.replace_stream(wrapped);

        let algorithm = self.algorithm;
        ctx.add_metadata_finalizer(move |metadata| {
            if let Some(hash) = slot.lock().unwrap().take() {
                metadata.insert("hash".to_owned(), hash);
                metadata.insert("hash_algorithm".to_owned(), algorithm.as_str().to_owned());
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::FileInfo;

    fn ctx(payload: &'static [u8]) -> UploadContext {
        UploadContext::new(
            stream::once(Bytes::from_static(payload)),
            FileInfo {
                field_name: "f".to_owned(),
                filename: "x".to_owned(),
                mime_type: "application/octet-stream".to_owned(),
                encoding: "7bit".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn sha256_recorded_after_drain() {
        let transformer = ChecksumTransformer::default();
        let mut ctx = ctx(b"abc");
        transformer.process(&mut ctx).await.unwrap();

        // hash is not available until the stream is drained
        let drained = stream::collect_limited(ctx.take_stream().unwrap(), 1 << 20).await.unwrap();
        assert_eq!(drained.len(), 1);
        ctx.run_finalizers();

        assert_eq!(
            ctx.metadata.get("hash").map(String::as_str),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(ctx.metadata.get("hash_algorithm").map(String::as_str), Some("sha256"));
    }

    #[tokio::test]
    async fn md5_algorithm() {
        let transformer = ChecksumTransformer::new(HashAlgorithm::Md5);
        let mut ctx = ctx(b"abc");
        transformer.process(&mut ctx).await.unwrap();
        let _ = stream::collect_limited(ctx.take_stream().unwrap(), 1 << 20).await.unwrap();
        ctx.run_finalizers();
        assert_eq!(ctx.metadata.get("hash").map(String::as_str), Some("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(ctx.metadata.get("hash_algorithm").map(String::as_str), Some("md5"));
    }

    #[tokio::test]
    async fn undrained_stream_leaves_no_hash() {
        let transformer = ChecksumTransformer::default();
        let mut ctx = ctx(b"abc");
        transformer.process(&mut ctx).await.unwrap();
        drop(ctx.take_stream());
        ctx.run_finalizers();
        assert!(ctx.metadata.get("hash").is_none());
    }
}
