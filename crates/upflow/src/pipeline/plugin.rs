//! Plugin traits
//!
//! Three kinds of plugin compose around a file stream: validators inspect
//! (and may wrap) it, transformers replace it, and a storage sink consumes
//! it. All share the lifecycle pair `initialize` / `shutdown`, called once
//! per process, and `cleanup`, called when a pipeline fails after the
//! plugin has run.

use crate::UploadError;
use crate::UploadResult;
use crate::pipeline::UploadContext;

use std::collections::HashMap;

use serde::Serialize;

/// Common plugin lifecycle.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn initialize(&self) -> UploadResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> UploadResult<()> {
        Ok(())
    }
}

/// Inspects the upload and rejects it with a typed error, or wraps the
/// stream (peek-then-replay) and lets it continue.
#[async_trait::async_trait]
pub trait Validator: Plugin {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()>;

    async fn cleanup(&self, _ctx: &mut UploadContext, _err: &UploadError) -> UploadResult<()> {
        Ok(())
    }
}

/// Replaces the context's stream with a transformed one.
///
/// A transformer that leaves no stream behind is a contract violation and
/// fails the pipeline with `PLUGIN_MISBEHAVIOR`.
#[async_trait::async_trait]
pub trait Transformer: Plugin {
    async fn process(&self, ctx: &mut UploadContext) -> UploadResult<()>;

    async fn cleanup(&self, _ctx: &mut UploadContext, _err: &UploadError) -> UploadResult<()> {
        Ok(())
    }
}

/// Terminal plugin: consumes the stream and returns where the bytes went.
#[async_trait::async_trait]
pub trait StorageSink: Plugin {
    async fn store(&self, ctx: &mut UploadContext) -> UploadResult<StorageDescriptor>;

    async fn cleanup(&self, _ctx: &mut UploadContext, _err: &UploadError) -> UploadResult<()> {
        Ok(())
    }
}

/// Where a sink put the bytes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageDescriptor {
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// backend-specific keys not covered by the named fields
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl StorageDescriptor {
    #[must_use]
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Self::default()
        }
    }
}
