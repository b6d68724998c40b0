//! Per-file plugin pipeline
//!
//! For each file stream the pipeline runs validators in order, then
//! transformers in order, then one or more storage sinks. On failure the
//! current stream is dropped and `cleanup` runs on every plugin whose
//! `process` was invoked, in reverse order; cleanup failures are logged
//! and swallowed so every plugin gets its chance to compensate.

mod context;
mod plugin;

pub use self::context::UploadContext;
pub use self::plugin::{Plugin, StorageDescriptor, StorageSink, Transformer, Validator};

use crate::UploadError;
use crate::UploadResult;
use crate::multipart::FileInfo;
use crate::stream::{self, BoxByteStream, CountingStream};
use crate::upload_error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

/// Result of one file's pipeline run.
#[derive(Debug)]
pub struct PipelineOutput {
    /// primary sink's descriptor
    pub storage: StorageDescriptor,
    /// descriptors of secondary sinks, in configuration order
    pub additional_storage: Vec<StorageDescriptor>,
    pub metadata: HashMap<String, String>,
    /// bytes delivered to the sink phase
    pub size: u64,
}

enum Executed {
    Validator(Arc<dyn Validator>),
    Transformer(Arc<dyn Transformer>),
    Sink(Arc<dyn StorageSink>),
}

impl Executed {
    fn name(&self) -> &'static str {
        match self {
            Self::Validator(p) => p.name(),
            Self::Transformer(p) => p.name(),
            Self::Sink(p) => p.name(),
        }
    }

    async fn cleanup(&self, ctx: &mut UploadContext, err: &UploadError) -> UploadResult<()> {
        match self {
            Self::Validator(p) => p.cleanup(ctx, err).await,
            Self::Transformer(p) => p.cleanup(ctx, err).await,
            Self::Sink(p) => p.cleanup(ctx, err).await,
        }
    }
}

/// Ordered validator and transformer chains shared by all files of a
/// coordinator. Sinks are supplied per execution because the coordinator
/// decides the primary/secondary split.
pub struct PluginPipeline {
    validators: Vec<Arc<dyn Validator>>,
    transformers: Vec<Arc<dyn Transformer>>,
}

impl PluginPipeline {
    #[must_use]
    pub fn new(validators: Vec<Arc<dyn Validator>>, transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self { validators, transformers }
    }

    /// Fans `initialize` out to all plugins in registration order.
    pub async fn initialize(&self) -> UploadResult<()> {
        for v in &self.validators {
            v.initialize().await?;
        }
        for t in &self.transformers {
            t.initialize().await?;
        }
        Ok(())
    }

    /// Fans `shutdown` out to all plugins in registration order.
    /// Shutdown failures are logged, not propagated.
    pub async fn shutdown(&self) {
        for v in &self.validators {
            if let Err(e) = v.shutdown().await {
                warn!(plugin = v.name(), error = %e, "plugin shutdown failed");
            }
        }
        for t in &self.transformers {
            if let Err(e) = t.shutdown().await {
                warn!(plugin = t.name(), error = %e, "plugin shutdown failed");
            }
        }
    }

    /// Runs one file through validators, transformers and the sinks.
    ///
    /// `sinks[0]` is the primary; all sinks receive the transformed bytes.
    ///
    /// # Errors
    /// The first plugin or stream failure, after reverse-order cleanup.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(field = %ctx.file_info.field_name, filename = %ctx.file_info.filename)
    )]
    pub async fn execute(&self, mut ctx: UploadContext, sinks: &[Arc<dyn StorageSink>]) -> UploadResult<PipelineOutput> {
        assert!(!sinks.is_empty(), "pipeline requires at least one sink");

        let mut executed = Vec::new();
        match self.run_phases(&mut ctx, sinks, &mut executed).await {
            Ok((storage, additional_storage, size)) => {
                ctx.run_finalizers();
                debug!(size, driver = %storage.driver, "pipeline completed");
                Ok(PipelineOutput {
                    storage,
                    additional_storage,
                    metadata: std::mem::take(&mut ctx.metadata),
                    size,
                })
            }
            Err(err) => {
                // destroy the in-flight stream before compensating
                drop(ctx.take_stream());
                for plugin in executed.iter().rev() {
                    if let Err(cleanup_err) = plugin.cleanup(&mut ctx, &err).await {
                        warn!(plugin = plugin.name(), error = %cleanup_err, "plugin cleanup failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        ctx: &mut UploadContext,
        sinks: &[Arc<dyn StorageSink>],
        executed: &mut Vec<Executed>,
    ) -> UploadResult<(StorageDescriptor, Vec<StorageDescriptor>, u64)> {
        for v in &self.validators {
            executed.push(Executed::Validator(Arc::clone(v)));
            v.process(ctx).await?;
            if !ctx.has_stream() {
                return Err(upload_error!(PluginMisbehavior, "validator {} consumed the stream", v.name()));
            }
        }

        for t in &self.transformers {
            executed.push(Executed::Transformer(Arc::clone(t)));
            t.process(ctx).await?;
            if !ctx.has_stream() {
                return Err(upload_error!(PluginMisbehavior, "transformer {} returned no stream", t.name()));
            }
        }

        let counter = Arc::new(AtomicU64::new(0));
        let transformed = ctx
            .take_stream()
            .ok_or_else(|| upload_error!(PluginMisbehavior, "pipeline lost its stream"))?;
        let counted = stream::boxed(CountingStream::new(transformed, Arc::clone(&counter)));

        if let [sink] = sinks {
            ctx.replace_stream(counted);
            executed.push(Executed::Sink(Arc::clone(sink)));
            let descriptor = sink.store(ctx).await?;
            return Ok((descriptor, Vec::new(), counter.load(Ordering::Relaxed)));
        }

        for sink in sinks {
            executed.push(Executed::Sink(Arc::clone(sink)));
        }
        let mut descriptors = stream::multiplex::execute_parallel(counted, sinks, ctx).await?;
        let storage = descriptors.remove(0);
        Ok((storage, descriptors, counter.load(Ordering::Relaxed)))
    }
}

/// Builds the context for one file and hands it to the pipeline.
///
/// Convenience wrapper used by the coordinator and by tests that do not
/// need to pre-populate the context.
pub async fn execute_file(
    pipeline: &PluginPipeline,
    source: BoxByteStream,
    file_info: FileInfo,
    sinks: &[Arc<dyn StorageSink>],
) -> UploadResult<PipelineOutput> {
    pipeline.execute(UploadContext::new(source, file_info), sinks).await
}
