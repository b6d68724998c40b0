//! Magic-byte validator
//!
//! Peeks the leading bytes of the stream, checks them against accepted
//! signatures, then replays the peeked prefix so downstream plugins see
//! the full stream. Signatures are supplied by the caller; a handful of
//! common formats ship as constructors.

use crate::UploadResult;
use crate::pipeline::{Plugin, UploadContext, Validator};
use crate::stream;
use crate::upload_error;

/// One accepted file signature.
#[derive(Debug, Clone)]
pub struct MagicSignature {
    pub mime_type: String,
    pub offset: usize,
    pub pattern: Vec<u8>,
}

impl MagicSignature {
    #[must_use]
    pub fn new(mime_type: impl Into<String>, offset: usize, pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            offset,
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn png() -> Self {
        Self::new("image/png", 0, &b"\x89PNG\r\n\x1a\n"[..])
    }

    #[must_use]
    pub fn jpeg() -> Self {
        Self::new("image/jpeg", 0, &[0xFF, 0xD8, 0xFF][..])
    }

    #[must_use]
    pub fn gif() -> Self {
        Self::new("image/gif", 0, &b"GIF8"[..])
    }

    #[must_use]
    pub fn pdf() -> Self {
        Self::new("application/pdf", 0, &b"%PDF-"[..])
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix
            .get(self.offset..self.offset + self.pattern.len())
            .is_some_and(|window| window == self.pattern)
    }
}

/// Validator that requires the stream to start with one of the accepted
/// signatures. The matching signature's MIME type is recorded as
/// `detected_mime_type` metadata.
pub struct MagicByteValidator {
    signatures: Vec<MagicSignature>,
    peek_len: usize,
}

impl MagicByteValidator {
    /// # Panics
    /// Panics if `signatures` is empty.
    #[must_use]
    pub fn new(signatures: Vec<MagicSignature>) -> Self {
        assert!(!signatures.is_empty(), "MagicByteValidator requires at least one signature");
        let peek_len = signatures.iter().map(|s| s.offset + s.pattern.len()).max().unwrap_or(0);
        Self { signatures, peek_len }
    }

    /// Accepts png, jpeg, gif and pdf.
    #[must_use]
    pub fn common_formats() -> Self {
        Self::new(vec![
            MagicSignature::png(),
            MagicSignature::jpeg(),
            MagicSignature::gif(),
            MagicSignature::pdf(),
        ])
    }
}

impl Plugin for MagicByteValidator {
    fn name(&self) -> &'static str {
        "magic-bytes"
    }
}

#[async_trait::async_trait]
impl Validator for MagicByteValidator {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()> {
        let input = ctx
            .take_stream()
            .ok_or_else(|| upload_error!(PluginMisbehavior, "magic-bytes validator has no stream"))?;
        let (prefix, replayed) = stream::peek_prefix(input, self.peek_len).await?;
        ctx.replace_stream(replayed);

        match self.signatures.iter().find(|s| s.matches(&prefix)) {
            Some(signature) => {
                ctx.metadata
                    .insert("detected_mime_type".to_owned(), signature.mime_type.clone());
                Ok(())
            }
            None => Err(upload_error!(
                MagicByteMismatch,
                "leading bytes of {:?} match no accepted signature",
                ctx.file_info.filename
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::FileInfo;

    use bytes::Bytes;

    fn ctx(payload: &'static [u8]) -> UploadContext {
        UploadContext::new(
            stream::iter(payload.iter().map(|b| Bytes::copy_from_slice(std::slice::from_ref(b))).collect()),
            FileInfo {
                field_name: "f".to_owned(),
                filename: "x.png".to_owned(),
                mime_type: "image/png".to_owned(),
                encoding: "7bit".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn detects_signature_and_replays_all_bytes() {
        let validator = MagicByteValidator::common_formats();
        let payload = b"\x89PNG\r\n\x1a\n rest of the image";
        let mut ctx = ctx(payload);

        validator.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.metadata.get("detected_mime_type").map(String::as_str), Some("image/png"));

        let replayed = stream::collect_limited(ctx.take_stream().unwrap(), 1 << 20).await.unwrap();
        let all: Vec<u8> = replayed.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(all, payload);
    }

    #[tokio::test]
    async fn mismatch_is_rejected() {
        let validator = MagicByteValidator::new(vec![MagicSignature::png()]);
        let mut ctx = ctx(b"not a png at all");
        let err = validator.process(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::MagicByteMismatch);
    }

    #[tokio::test]
    async fn short_stream_is_rejected_not_panicking() {
        let validator = MagicByteValidator::new(vec![MagicSignature::png()]);
        let mut ctx = ctx(b"\x89P");
        let err = validator.process(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::MagicByteMismatch);
    }

    #[tokio::test]
    async fn offset_signature() {
        let validator = MagicByteValidator::new(vec![MagicSignature::new("video/mp4", 4, &b"ftyp"[..])]);
        let mut ctx = ctx(b"\x00\x00\x00\x18ftypmp42 more");
        validator.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.metadata.get("detected_mime_type").map(String::as_str), Some("video/mp4"));
    }
}
