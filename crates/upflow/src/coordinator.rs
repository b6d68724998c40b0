//! Upload coordinator
//!
//! Bridges an HTTP request to the parser and the per-file pipelines.
//! Built once per process with [`UploadCoordinatorBuilder`], then
//! [`handle`](UploadCoordinator::handle) is called per request. The
//! coordinator is cheaply cloneable via its internal `Arc`.

use crate::UploadError;
use crate::UploadResult;
use crate::config::{UploadConfig, UploadLimits};
use crate::error::StdError;
use crate::multipart::{self, FileInfo, Part};
use crate::pipeline::{PipelineOutput, PluginPipeline, StorageDescriptor, StorageSink, Transformer, UploadContext, Validator};
use crate::rate_limit::TokenBucketRateLimiter;
use crate::stream;
use crate::upload_error;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error};

/// A field's value; duplicates promote the entry to an ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    One(String),
    Many(Vec<String>),
}

impl FieldValue {
    fn push(&mut self, value: String) {
        match self {
            Self::One(first) => *self = Self::Many(vec![std::mem::take(first), value]),
            Self::Many(values) => values.push(value),
        }
    }

    /// The single value, or the first of a sequence.
    #[must_use]
    pub fn first(&self) -> &str {
        match self {
            Self::One(v) => v,
            Self::Many(values) => values.first().map_or("", String::as_str),
        }
    }
}

/// One successfully stored file.
#[derive(Debug, Serialize)]
pub struct UploadedFile {
    pub field_name: String,
    pub filename: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
    pub size: u64,
    pub storage: StorageDescriptor,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_storage: Vec<StorageDescriptor>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl UploadedFile {
    fn from_parts(info: FileInfo, output: PipelineOutput) -> Self {
        let mut metadata = output.metadata;
        Self {
            field_name: info.field_name,
            filename: info.filename,
            mime_type: info.mime_type,
            detected_mime_type: metadata.remove("detected_mime_type"),
            hash: metadata.remove("hash"),
            hash_algorithm: metadata.remove("hash_algorithm"),
            size: output.size,
            storage: output.storage,
            additional_storage: output.additional_storage,
            metadata,
        }
    }
}

/// Aggregated result of one request.
#[derive(Debug, Default, Serialize)]
pub struct UploadOutcome {
    pub fields: HashMap<String, FieldValue>,
    /// files in emission order, not completion order
    pub files: Vec<UploadedFile>,
}

type FieldCallback = Box<dyn Fn(&str, &str) + Send + Sync>;
type FileCallback = Box<dyn Fn(&UploadedFile) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&UploadError) + Send + Sync>;
type FinishCallback = Box<dyn Fn(&UploadOutcome) + Send + Sync>;

/// Builder for [`UploadCoordinator`].
#[derive(Default)]
pub struct UploadCoordinatorBuilder {
    config: UploadConfig,
    validators: Vec<Arc<dyn Validator>>,
    transformers: Vec<Arc<dyn Transformer>>,
    sinks: Vec<Arc<dyn StorageSink>>,
    rate_limiter: Option<Arc<TokenBucketRateLimiter>>,
    on_field: Option<FieldCallback>,
    on_file: Option<FileCallback>,
    on_error: Option<ErrorCallback>,
    on_finish: Option<FinishCallback>,
}

impl UploadCoordinatorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&mut self, config: UploadConfig) {
        self.config = config;
    }

    pub fn set_limits(&mut self, limits: UploadLimits) {
        self.config.limits = limits;
    }

    /// Validators run in registration order, before transformers.
    pub fn add_validator(&mut self, validator: impl Validator) {
        self.validators.push(Arc::new(validator));
    }

    /// Transformers run in registration order, after validators.
    pub fn add_transformer(&mut self, transformer: impl Transformer) {
        self.transformers.push(Arc::new(transformer));
    }

    /// The first registered sink is the primary; additional sinks receive
    /// the transformed bytes via the multiplexer.
    pub fn add_storage(&mut self, sink: impl StorageSink) {
        self.sinks.push(Arc::new(sink));
    }

    pub fn add_shared_storage(&mut self, sink: Arc<dyn StorageSink>) {
        self.sinks.push(sink);
    }

    pub fn set_rate_limiter(&mut self, limiter: Arc<TokenBucketRateLimiter>) {
        self.rate_limiter = Some(limiter);
    }

    pub fn on_field(&mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.on_field = Some(Box::new(f));
    }

    pub fn on_file(&mut self, f: impl Fn(&UploadedFile) + Send + Sync + 'static) {
        self.on_file = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl Fn(&UploadError) + Send + Sync + 'static) {
        self.on_error = Some(Box::new(f));
    }

    pub fn on_finish(&mut self, f: impl Fn(&UploadOutcome) + Send + Sync + 'static) {
        self.on_finish = Some(Box::new(f));
    }

    /// # Errors
    /// Fails when no storage sink is configured.
    pub fn build(self) -> UploadResult<UploadCoordinator> {
        if self.sinks.is_empty() {
            return Err(upload_error!(InternalError, "no storage sink configured"));
        }
        Ok(UploadCoordinator {
            inner: Arc::new(Inner {
                config: self.config,
                pipeline: PluginPipeline::new(self.validators, self.transformers),
                sinks: self.sinks,
                rate_limiter: self.rate_limiter,
                on_field: self.on_field,
                on_file: self.on_file,
                on_error: self.on_error,
                on_finish: self.on_finish,
            }),
        })
    }
}

struct Inner {
    config: UploadConfig,
    pipeline: PluginPipeline,
    sinks: Vec<Arc<dyn StorageSink>>,
    rate_limiter: Option<Arc<TokenBucketRateLimiter>>,
    on_field: Option<FieldCallback>,
    on_file: Option<FileCallback>,
    on_error: Option<ErrorCallback>,
    on_finish: Option<FinishCallback>,
}

/// Accepts multipart requests and produces [`UploadOutcome`]s.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCoordinator").finish_non_exhaustive()
    }
}

impl UploadCoordinator {
    /// Fans `initialize` out to every plugin in registration order.
    ///
    /// # Errors
    /// The first initialization failure.
    pub async fn initialize(&self) -> UploadResult<()> {
        self.inner.pipeline.initialize().await?;
        for sink in &self.inner.sinks {
            sink.initialize().await?;
        }
        Ok(())
    }

    /// Fans `shutdown` out to every plugin; failures are logged.
    pub async fn shutdown(&self) {
        self.inner.pipeline.shutdown().await;
        for sink in &self.inner.sinks {
            if let Err(e) = sink.shutdown().await {
                tracing::warn!(plugin = sink.name(), error = %e, "sink shutdown failed");
            }
        }
    }

    /// Processes one multipart request.
    ///
    /// # Errors
    /// The request's first error; `on_error` has already been invoked and
    /// all pending pipelines have settled (with cleanup) by the time this
    /// returns.
    #[tracing::instrument(level = "debug", skip_all, fields(uri = %request.uri()))]
    pub async fn handle<S>(&self, request: http::Request<S>) -> UploadResult<UploadOutcome>
    where
        S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
    {
        let result = self.handle_inner(request).await;
        match result {
            Ok(ref outcome) => {
                debug!(fields = outcome.fields.len(), files = outcome.files.len(), "upload complete");
                if let Some(ref cb) = self.inner.on_finish {
                    cb(outcome);
                }
            }
            Err(ref err) => {
                if err.status_code().is_server_error() {
                    error!(code = err.code().as_str(), "upload failed");
                } else {
                    debug!(code = err.code().as_str(), "upload rejected");
                }
                if let Some(ref cb) = self.inner.on_error {
                    cb(err);
                }
            }
        }
        result
    }

    async fn handle_inner<S>(&self, request: http::Request<S>) -> UploadResult<UploadOutcome>
    where
        S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
    {
        let (head, body) = request.into_parts();

        if let Some(ref limiter) = self.inner.rate_limiter {
            limiter.check_request(&head.headers, None)?;
        }

        let content_type = head
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| upload_error!(InvalidContentType, "missing content-type header"))?;
        let boundary = multipart::extract_boundary(content_type)?;
        let request_url = reconstruct_request_url(&head);

        let mut parts = multipart::parse_stream(body, &boundary, self.inner.config.limits);

        let mut fields: HashMap<String, FieldValue> = HashMap::new();
        let mut pending = Vec::new();
        let mut first_error: Option<UploadError> = None;

        while let Some(item) = parts.next().await {
            match item {
                Ok(Part::Field { name, value }) => {
                    if let Some(ref cb) = self.inner.on_field {
                        cb(&name, &value);
                    }
                    match fields.entry(name) {
                        Entry::Occupied(mut entry) => entry.get_mut().push(value),
                        Entry::Vacant(entry) => {
                            entry.insert(FieldValue::One(value));
                        }
                    }
                }
                Ok(Part::File { info, stream: file_stream }) => {
                    let mut ctx = UploadContext::new(stream::boxed(file_stream), info.clone());
                    ctx.request_url = request_url.clone();
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move { inner.pipeline.execute(ctx, &inner.sinks).await });
                    pending.push((info, task));
                }
                Err(err) => {
                    // first error wins; the part stream terminates after it
                    record_first(&mut first_error, err);
                }
            }
        }

        let mut files = Vec::with_capacity(pending.len());
        for (info, task) in pending {
            match task.await {
                Ok(Ok(output)) => {
                    let file = UploadedFile::from_parts(info, output);
                    if let Some(ref cb) = self.inner.on_file {
                        cb(&file);
                    }
                    files.push(file);
                }
                Ok(Err(err)) => record_first(&mut first_error, err),
                Err(join_err) => record_first(&mut first_error, UploadError::internal(join_err)),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(UploadOutcome { fields, files }),
        }
    }
}

fn record_first(slot: &mut Option<UploadError>, err: UploadError) {
    if slot.is_none() {
        *slot = Some(err);
    } else {
        debug!(code = err.code().as_str(), "suppressing subsequent error");
    }
}

/// Rebuilds the client-visible URL from forwarding headers and the
/// request target, for URL-validating plugins.
fn reconstruct_request_url(head: &http::request::Parts) -> Option<String> {
    let proto = head
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = match head.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host.to_owned(),
        None => head.uri.authority()?.to_string(),
    };
    let path_and_query = head.uri.path_and_query().map_or("/", http::uri::PathAndQuery::as_str);
    Some(format!("{proto}://{host}{path_and_query}"))
}
