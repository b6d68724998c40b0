//! In-memory storage sink for tests, demos and small deployments.

use crate::UploadResult;
use crate::pipeline::{Plugin, StorageDescriptor, StorageSink, UploadContext};
use crate::stream;
use crate::upload_error;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Keeps uploaded objects in a map, keyed by a sequence number and the
/// original filename.
pub struct MemorySink {
    max_object_size: u64,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    sequence: AtomicU64,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_object_size(DEFAULT_MAX_OBJECT_SIZE)
    }

    #[must_use]
    pub fn with_max_object_size(max_object_size: u64) -> Self {
        Self {
            max_object_size,
            objects: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns a stored object's bytes.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait::async_trait]
impl StorageSink for MemorySink {
    async fn store(&self, ctx: &mut UploadContext) -> UploadResult<StorageDescriptor> {
        let source = ctx
            .take_stream()
            .ok_or_else(|| upload_error!(PluginMisbehavior, "memory sink has no stream"))?;
        let chunks = stream::collect_limited(source, self.max_object_size).await?;

        let mut data = Vec::with_capacity(chunks.iter().map(bytes::Bytes::len).sum());
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }
        let size = data.len() as u64;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = format!("{seq:06}-{}", ctx.file_info.filename);
        self.objects.lock().unwrap().insert(key.clone(), data);

        let mut descriptor = StorageDescriptor::new("memory");
        descriptor.path = Some(key);
        descriptor.size = Some(size);
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::FileInfo;

    use bytes::Bytes;

    fn ctx(payload: &'static [u8]) -> UploadContext {
        UploadContext::new(
            stream::once(Bytes::from_static(payload)),
            FileInfo {
                field_name: "f".to_owned(),
                filename: "h.txt".to_owned(),
                mime_type: "text/plain".to_owned(),
                encoding: "7bit".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn stores_and_describes() {
        let sink = MemorySink::new();
        let descriptor = sink.store(&mut ctx(b"hello")).await.unwrap();
        assert_eq!(descriptor.driver, "memory");
        assert_eq!(descriptor.size, Some(5));
        let key = descriptor.path.unwrap();
        assert_eq!(sink.get(&key).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn object_size_cap() {
        let sink = MemorySink::with_max_object_size(3);
        let err = sink.store(&mut ctx(b"too large")).await.unwrap_err();
        assert_eq!(err.code(), crate::UploadErrorCode::LimitExceeded);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn keys_are_unique_per_upload() {
        let sink = MemorySink::new();
        let a = sink.store(&mut ctx(b"one")).await.unwrap().path.unwrap();
        let b = sink.store(&mut ctx(b"two")).await.unwrap().path.unwrap();
        assert_ne!(a, b);
        assert_eq!(sink.len(), 2);
    }
}
