//! Per-file upload context passed through the plugin chain.

use crate::multipart::FileInfo;
use crate::signed_url::UploadConstraints;
use crate::stream::BoxByteStream;

use std::collections::HashMap;
use std::fmt;

type MetadataFinalizer = Box<dyn FnOnce(&mut HashMap<String, String>) + Send + Sync>;

/// Mutable state for one file's trip through the pipeline.
///
/// The byte stream moves through the context: validators may take it and
/// put back a wrapped one, transformers must put back a replacement, and
/// the storage sink finally consumes it.
pub struct UploadContext {
    stream: Option<BoxByteStream>,
    pub file_info: FileInfo,
    pub metadata: HashMap<String, String>,
    /// constraints recovered from a validated signed URL, if any
    pub constraints: Option<UploadConstraints>,
    /// full request URL as seen by the client, for URL-validating plugins
    pub request_url: Option<String>,
    finalizers: Vec<MetadataFinalizer>,
}

impl UploadContext {
    #[must_use]
    pub fn new(stream: BoxByteStream, file_info: FileInfo) -> Self {
        Self {
            stream: Some(stream),
            file_info,
            metadata: HashMap::new(),
            constraints: None,
            request_url: None,
            finalizers: Vec::new(),
        }
    }

    #[must_use]
    pub fn take_stream(&mut self) -> Option<BoxByteStream> {
        self.stream.take()
    }

    pub fn replace_stream(&mut self, stream: BoxByteStream) {
        self.stream = Some(stream);
    }

    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Registers a closure that contributes metadata after the stream has
    /// been fully consumed. Needed by pass-through transformers whose
    /// result (a digest, a byte count) only exists at end of stream.
    pub fn add_metadata_finalizer(&mut self, f: impl FnOnce(&mut HashMap<String, String>) + Send + Sync + 'static) {
        self.finalizers.push(Box::new(f));
    }

    pub(crate) fn run_finalizers(&mut self) {
        for f in self.finalizers.drain(..) {
            f(&mut self.metadata);
        }
    }

    /// Shallow copy for a sibling sink: shared file facts, its own stream.
    #[must_use]
    pub fn fork(&self, stream: BoxByteStream) -> Self {
        Self {
            stream: Some(stream),
            file_info: self.file_info.clone(),
            metadata: self.metadata.clone(),
            constraints: self.constraints.clone(),
            request_url: self.request_url.clone(),
            finalizers: Vec::new(),
        }
    }
}

impl fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadContext")
            .field("file_info", &self.file_info)
            .field("metadata", &self.metadata)
            .field("has_stream", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}
