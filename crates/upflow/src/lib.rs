//! Streaming multipart upload engine
//!
//! `upflow` consumes an HTTP request body encoded as `multipart/form-data`
//! (RFC 7578), decomposes it into text fields and file streams without
//! buffering whole files, pushes each file through a configurable chain of
//! validators and transformers, and hands the bytes to one or more storage
//! sinks.
//!
//! # Features
//!
//! - **Streaming parser**: a push-driven state machine with a cross-chunk
//!   boundary scanner; memory use is bounded regardless of file size
//! - **Plugin pipeline**: validators, transformers and storage sinks
//!   compose around a single file stream with ordered cleanup on failure
//! - **Fan-out**: tee-style multiplexing to parallel storage sinks with
//!   shared-failure semantics
//! - **Signed URLs**: HMAC-SHA256 issuance and validation with expiry and
//!   replay prevention
//! - **Rate limiting**: per-key token buckets in a bounded LRU map
//!
//! # Example
//!
//! ```rust,no_run
//! use upflow::UploadCoordinatorBuilder;
//! use upflow::plugins::{AllowedTypesValidator, ChecksumTransformer};
//! use upflow::storage::MemorySink;
//!
//! # async fn example(request: http::Request<upflow::stream::BoxBodyStream>) -> upflow::UploadResult<()> {
//! let mut builder = UploadCoordinatorBuilder::new();
//! builder.add_validator(AllowedTypesValidator::new(["image/*", "application/pdf"]));
//! builder.add_transformer(ChecksumTransformer::default());
//! builder.add_storage(MemorySink::new());
//! let coordinator = builder.build()?;
//!
//! let outcome = coordinator.handle(request).await?;
//! for file in &outcome.files {
//!     println!("{} -> {:?}", file.filename, file.storage.path);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`multipart`]: boundary scanner, push parser, async part stream
//! - [`pipeline`]: plugin traits and per-file orchestration
//! - [`stream`]: byte stream plumbing and the multiplexer
//! - [`coordinator`]: request-level aggregation
//! - [`signed_url`]: signed upload URLs
//! - [`rate_limit`]: token-bucket admission control
//! - [`lru`]: the shared bounded-map primitive
//! - [`plugins`]: built-in validators and transformers
//! - [`storage`]: built-in storage sinks
//!
//! # Security
//!
//! The engine enforces the limits it is configured with, but it is the
//! embedder's responsibility to bound total request body size at the HTTP
//! layer and to terminate TLS in front of signed-URL validation.

#[macro_use]
mod error;

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod lru;
pub mod multipart;
pub mod pipeline;
pub mod plugins;
pub mod rate_limit;
pub mod signed_url;
pub mod storage;
pub mod stream;

pub use self::coordinator::{FieldValue, UploadCoordinator, UploadCoordinatorBuilder, UploadOutcome, UploadedFile};
pub use self::error::{StdError, UploadError, UploadErrorCode, UploadResult};
