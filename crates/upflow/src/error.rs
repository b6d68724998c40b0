//! Typed upload errors
//!
//! Every failure that crosses a component boundary is an [`UploadError`]:
//! a stable string code, a suggested HTTP status code, an optional
//! human-readable message and an optional source error.

use std::fmt;

use http::StatusCode;

/// Boxed error type shared by stream items and plugin failures.
pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used throughout this crate.
pub type UploadResult<T = (), E = UploadError> = Result<T, E>;

/// Stable error codes exposed at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum UploadErrorCode {
    /// `Content-Type` is not multipart/form-data
    InvalidContentType,
    /// multipart boundary parameter is absent
    MissingBoundary,
    /// a part header block could not be parsed
    MalformedHeader,
    /// a part has no `Content-Disposition` header
    MissingContentDisposition,
    /// the request body ended before the final boundary
    UnexpectedEnd,
    /// a configured parser limit was exceeded
    LimitExceeded,
    /// admission rejected by the rate limiter
    RateLimitExceeded,
    /// signed URL has no `signature` parameter
    SignedUrlMissingSignature,
    /// signed URL signature does not match
    SignedUrlInvalid,
    /// signed URL is past its expiry
    SignedUrlExpired,
    /// signed URL was already consumed
    SignedUrlReplayed,
    /// declared content type is not in the allowlist
    TypeNotAllowed,
    /// leading bytes do not match any accepted signature
    MagicByteMismatch,
    /// a storage sink failed while writing
    StorageWriteFailed,
    /// a storage sink could not be reached
    StorageUnavailable,
    /// a plugin violated its contract
    PluginMisbehavior,
    /// unclassified internal failure
    InternalError,
}

impl UploadErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidContentType => "INVALID_CONTENT_TYPE",
            Self::MissingBoundary => "MISSING_BOUNDARY",
            Self::MalformedHeader => "MALFORMED_HEADER",
            Self::MissingContentDisposition => "MISSING_CONTENT_DISPOSITION",
            Self::UnexpectedEnd => "UNEXPECTED_END",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SignedUrlMissingSignature => "SIGNED_URL_MISSING_SIGNATURE",
            Self::SignedUrlInvalid => "SIGNED_URL_INVALID",
            Self::SignedUrlExpired => "SIGNED_URL_EXPIRED",
            Self::SignedUrlReplayed => "SIGNED_URL_REPLAYED",
            Self::TypeNotAllowed => "TYPE_NOT_ALLOWED",
            Self::MagicByteMismatch => "MAGIC_BYTE_MISMATCH",
            Self::StorageWriteFailed => "STORAGE_WRITE_FAILED",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::PluginMisbehavior => "PLUGIN_MISBEHAVIOR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Suggested HTTP status code for this error class.
    #[must_use]
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::InvalidContentType
            | Self::MissingBoundary
            | Self::MalformedHeader
            | Self::MissingContentDisposition
            | Self::UnexpectedEnd
            | Self::MagicByteMismatch => StatusCode::BAD_REQUEST,
            Self::LimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::SignedUrlMissingSignature
            | Self::SignedUrlInvalid
            | Self::SignedUrlExpired
            | Self::SignedUrlReplayed => StatusCode::FORBIDDEN,
            Self::TypeNotAllowed => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::StorageWriteFailed | Self::PluginMisbehavior | Self::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for UploadErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type crossing the engine's public boundary.
pub struct UploadError {
    code: UploadErrorCode,
    message: Option<Box<str>>,
    status: StatusCode,
    source: Option<StdError>,
}

impl UploadError {
    #[must_use]
    pub fn new(code: UploadErrorCode) -> Self {
        Self {
            code,
            message: None,
            status: code.status_code(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_message(code: UploadErrorCode, message: impl Into<String>) -> Self {
        let mut err = Self::new(code);
        err.set_message(message);
        err
    }

    #[must_use]
    pub fn internal(source: impl Into<StdError>) -> Self {
        let mut err = Self::new(UploadErrorCode::InternalError);
        err.set_source(source.into());
        err
    }

    #[must_use]
    pub fn code(&self) -> UploadErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into().into_boxed_str());
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_source(&mut self, source: StdError) {
        self.source = Some(source);
    }

    /// Copies code, status and message into a fresh error.
    ///
    /// Sources are not cloneable; the source's rendering is folded into the
    /// replica's message. Used when one failure must be delivered to several
    /// consumers (e.g. the multiplexer's siblings).
    #[must_use]
    pub fn replicate(&self) -> Self {
        let message = match (&self.message, &self.source) {
            (Some(m), Some(s)) => Some(format!("{m}: {s}").into_boxed_str()),
            (Some(m), None) => Some(m.clone()),
            (None, Some(s)) => Some(s.to_string().into_boxed_str()),
            (None, None) => None,
        };
        Self {
            code: self.code,
            message,
            status: self.status,
            source: None,
        }
    }
}

impl From<UploadErrorCode> for UploadError {
    fn from(code: UploadErrorCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Debug for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("UploadError");
        d.field("code", &self.code.as_str());
        d.field("status", &self.status);
        if let Some(ref message) = self.message {
            d.field("message", message);
        }
        if let Some(ref source) = self.source {
            d.field("source", source);
        }
        d.finish()
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if let Some(ref message) = self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Constructs an [`UploadError`].
///
/// ```
/// use upflow::upload_error;
/// let err = upload_error!(TypeNotAllowed, "mime type {} is not allowed", "text/x-sh");
/// assert_eq!(err.code().as_str(), "TYPE_NOT_ALLOWED");
/// ```
#[macro_export]
macro_rules! upload_error {
    ($code:ident) => {
        $crate::UploadError::new($crate::UploadErrorCode::$code)
    };
    ($code:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let mut err = $crate::UploadError::new($crate::UploadErrorCode::$code);
        err.set_message(format!($fmt $(, $arg)*));
        err
    }};
    ($source:expr, $code:ident) => {{
        let mut err = $crate::UploadError::new($crate::UploadErrorCode::$code);
        err.set_source(Box::new($source));
        err
    }};
    ($source:expr, $code:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let mut err = $crate::UploadError::new($crate::UploadErrorCode::$code);
        err.set_message(format!($fmt $(, $arg)*));
        err.set_source(Box::new($source));
        err
    }};
}
