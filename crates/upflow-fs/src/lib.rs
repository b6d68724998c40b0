//! Filesystem storage sink for `upflow`
//!
//! Streams each file to a hidden temp file under the sink root, fsyncs,
//! then atomically renames it into place, so a crash or failed upload
//! never leaves a partially written object under its final name.

use upflow::UploadResult;
use upflow::pipeline::{Plugin, StorageDescriptor, StorageSink, UploadContext};
use upflow::upload_error;

use std::path::{Path, PathBuf};

use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Stores uploads as files under a root directory.
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write_stream(&self, ctx: &mut UploadContext, tmp_path: &Path) -> UploadResult<u64> {
        let mut source = ctx
            .take_stream()
            .ok_or_else(|| upload_error!(PluginMisbehavior, "fs sink has no stream"))?;

        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| upload_error!(e, StorageWriteFailed, "failed to create {}", tmp_path.display()))?;

        let mut written: u64 = 0;
        while let Some(item) = source.next().await {
            let bytes = item?;
            file.write_all(&bytes)
                .await
                .map_err(|e| upload_error!(e, StorageWriteFailed, "write to {} failed", tmp_path.display()))?;
            written += bytes.len() as u64;
        }

        file.sync_all()
            .await
            .map_err(|e| upload_error!(e, StorageWriteFailed, "fsync of {} failed", tmp_path.display()))?;
        Ok(written)
    }
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[async_trait::async_trait]
impl Plugin for FsSink {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn initialize(&self) -> UploadResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| upload_error!(e, StorageUnavailable, "storage root {} unavailable", self.root.display()))
    }
}

#[async_trait::async_trait]
impl StorageSink for FsSink {
    async fn store(&self, ctx: &mut UploadContext) -> UploadResult<StorageDescriptor> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| upload_error!(e, StorageUnavailable, "storage root {} unavailable", self.root.display()))?;

        let tmp_path = self.root.join(format!(".upload-{}", Uuid::new_v4()));
        let written = match self.write_stream(ctx, &tmp_path).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&tmp_path).await {
                    tracing::warn!(path = %tmp_path.display(), error = %remove_err, "failed to remove temp file");
                }
                return Err(err);
            }
        };

        let final_name = format!("{}-{}", Uuid::new_v4(), sanitize_filename(&ctx.file_info.filename));
        let final_path = self.root.join(&final_name);
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| upload_error!(e, StorageWriteFailed, "rename into {} failed", final_path.display()))?;

        tracing::debug!(path = %final_path.display(), written, "stored upload");

        let mut descriptor = StorageDescriptor::new("fs");
        descriptor.path = Some(final_path.display().to_string());
        descriptor.size = Some(written);
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_filename("photo.png"), "photo.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("weird name!.txt"), "weird_name_.txt");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("..."), "file");
    }
}
