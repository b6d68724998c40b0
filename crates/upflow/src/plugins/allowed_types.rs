//! Declared-MIME allowlist validator.

use crate::UploadResult;
use crate::pipeline::{Plugin, UploadContext, Validator};
use crate::upload_error;

/// Rejects uploads whose declared content type is not in the allowlist.
///
/// Patterns are exact (`image/png`) or type wildcards (`image/*`). This
/// validator trusts the client-declared type; pair it with
/// [`MagicByteValidator`](super::MagicByteValidator) when the first bytes
/// must agree.
pub struct AllowedTypesValidator {
    allowed: Vec<String>,
}

impl AllowedTypesValidator {
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(|p| p.into().to_ascii_lowercase()).collect(),
        }
    }
}

fn pattern_matches(pattern: &str, mime_type: &str) -> bool {
    if pattern == "*/*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return mime_type
            .split('/')
            .next()
            .is_some_and(|t| t.eq_ignore_ascii_case(prefix));
    }
    pattern.eq_ignore_ascii_case(mime_type)
}

impl Plugin for AllowedTypesValidator {
    fn name(&self) -> &'static str {
        "allowed-types"
    }
}

#[async_trait::async_trait]
impl Validator for AllowedTypesValidator {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()> {
        // strip parameters such as "; charset=utf-8"
        let declared = ctx
            .file_info
            .mime_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if self.allowed.iter().any(|p| pattern_matches(p, &declared)) {
            Ok(())
        } else {
            Err(upload_error!(TypeNotAllowed, "mime type {:?} is not allowed", declared))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::FileInfo;
    use crate::stream;

    fn ctx(mime_type: &str) -> UploadContext {
        UploadContext::new(
            stream::empty(),
            FileInfo {
                field_name: "f".to_owned(),
                filename: "x".to_owned(),
                mime_type: mime_type.to_owned(),
                encoding: "7bit".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn exact_and_wildcard_patterns() {
        let validator = AllowedTypesValidator::new(["image/*", "application/pdf"]);
        assert!(validator.process(&mut ctx("image/png")).await.is_ok());
        assert!(validator.process(&mut ctx("IMAGE/JPEG")).await.is_ok());
        assert!(validator.process(&mut ctx("application/pdf")).await.is_ok());
        assert!(validator.process(&mut ctx("text/plain; charset=utf-8")).await.is_err());

        let err = validator.process(&mut ctx("video/mp4")).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::TypeNotAllowed);
        assert_eq!(err.status_code(), http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn parameters_are_ignored() {
        let validator = AllowedTypesValidator::new(["text/plain"]);
        assert!(validator.process(&mut ctx("text/plain; charset=utf-8")).await.is_ok());
    }
}
