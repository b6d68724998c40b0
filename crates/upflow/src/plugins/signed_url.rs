//! Signed-URL validator plugin
//!
//! Validates the request URL the coordinator reconstructed from
//! `x-forwarded-proto`, `host` and the request path, then stashes the
//! recovered constraints and metadata on the context for later plugins.

use crate::UploadResult;
use crate::pipeline::{Plugin, UploadContext, Validator};
use crate::signed_url::UrlSigner;
use crate::upload_error;

use std::sync::Arc;

pub struct SignedUrlValidator {
    signer: Arc<UrlSigner>,
}

impl SignedUrlValidator {
    #[must_use]
    pub fn new(signer: Arc<UrlSigner>) -> Self {
        Self { signer }
    }
}

impl Plugin for SignedUrlValidator {
    fn name(&self) -> &'static str {
        "signed-url"
    }
}

#[async_trait::async_trait]
impl Validator for SignedUrlValidator {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()> {
        let url = ctx
            .request_url
            .clone()
            .ok_or_else(|| upload_error!(SignedUrlMissingSignature, "request URL is unavailable"))?;

        let validated = self.signer.validate(&url)?;

        if let Some(ref allowed) = validated.constraints.allowed_types {
            let declared = ctx.file_info.mime_type.split(';').next().unwrap_or("").trim();
            if !allowed.iter().any(|t| t.eq_ignore_ascii_case(declared)) {
                return Err(upload_error!(
                    TypeNotAllowed,
                    "mime type {:?} is not permitted by the signed url",
                    declared
                ));
            }
        }

        for (key, value) in &validated.metadata {
            ctx.metadata.insert(key.clone(), value.clone());
        }
        ctx.constraints = Some(validated.constraints);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::FileInfo;
    use crate::signed_url::SignOptions;
    use crate::stream;

    use std::collections::HashMap;

    fn ctx(mime_type: &str, request_url: Option<String>) -> UploadContext {
        let mut ctx = UploadContext::new(
            stream::empty(),
            FileInfo {
                field_name: "f".to_owned(),
                filename: "x.png".to_owned(),
                mime_type: mime_type.to_owned(),
                encoding: "7bit".to_owned(),
            },
        );
        ctx.request_url = request_url;
        ctx
    }

    #[tokio::test]
    async fn valid_url_populates_context() {
        let signer = Arc::new(UrlSigner::new("secret"));
        let mut metadata = HashMap::new();
        metadata.insert("tenant".to_owned(), "acme".to_owned());
        let url = signer
            .sign(
                "https://example.com/upload",
                &SignOptions {
                    expires_in: Some(60),
                    max_file_size: Some(1024),
                    allowed_types: Some(vec!["image/png".to_owned()]),
                    metadata,
                    ..SignOptions::default()
                },
            )
            .unwrap();

        let validator = SignedUrlValidator::new(signer);
        let mut ctx = ctx("image/png", Some(url));
        validator.process(&mut ctx).await.unwrap();

        let constraints = ctx.constraints.as_ref().unwrap();
        assert_eq!(constraints.max_file_size, Some(1024));
        assert_eq!(ctx.metadata.get("tenant").map(String::as_str), Some("acme"));
    }

    #[tokio::test]
    async fn disallowed_type_is_rejected() {
        let signer = Arc::new(UrlSigner::new("secret"));
        let url = signer
            .sign(
                "https://example.com/upload",
                &SignOptions {
                    expires_in: Some(60),
                    allowed_types: Some(vec!["image/png".to_owned()]),
                    ..SignOptions::default()
                },
            )
            .unwrap();

        let validator = SignedUrlValidator::new(signer);
        let mut ctx = ctx("application/zip", Some(url));
        let err = validator.process(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::TypeNotAllowed);
    }

    #[tokio::test]
    async fn missing_request_url_is_rejected() {
        let validator = SignedUrlValidator::new(Arc::new(UrlSigner::new("secret")));
        let mut ctx = ctx("image/png", None);
        let err = validator.process(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::SignedUrlMissingSignature);
    }

    #[tokio::test]
    async fn unsigned_request_url_is_rejected() {
        let validator = SignedUrlValidator::new(Arc::new(UrlSigner::new("secret")));
        let mut ctx = ctx("image/png", Some("https://example.com/upload".to_owned()));
        let err = validator.process(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::SignedUrlMissingSignature);
    }
}
