//! Engine configuration
//!
//! Configurable parameters for the upload engine with sensible defaults.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use upflow::config::{ConfigProvider, HotReloadConfigProvider, UploadConfig};
//!
//! let mut config = UploadConfig::default();
//! config.limits.file_size = 10 * 1024 * 1024;
//!
//! let provider = Arc::new(HotReloadConfigProvider::new(Arc::new(config)));
//! assert_eq!(provider.snapshot().limits.file_size, 10 * 1024 * 1024);
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Parser limits, all in bytes or counts.
///
/// Exceeding any of these terminates the current request with a
/// `LIMIT_EXCEEDED` error naming the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
    /// Maximum size of a single file part. Default: 100 MiB.
    pub file_size: u64,
    /// Maximum number of file parts per request. Default: 10.
    pub files: usize,
    /// Maximum number of text fields per request. Default: 100.
    pub fields: usize,
    /// Maximum size of a single field value. Default: 1 MiB.
    pub field_size: usize,
    /// Maximum length of a field name. Default: 100.
    pub field_name_size: usize,
    /// Maximum size of a part's header block. Default: 8 KiB.
    pub header_size: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            file_size: 100 * 1024 * 1024,
            files: 10,
            fields: 100,
            field_size: 1024 * 1024,
            field_name_size: 100,
            header_size: 8 * 1024,
        }
    }
}

/// Upload engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
#[non_exhaustive]
pub struct UploadConfig {
    /// Parser limits.
    pub limits: UploadLimits,
}

/// Configuration provider trait.
///
/// `snapshot` returns an `Arc<UploadConfig>` so a request reads a consistent
/// set of values even while the configuration is being updated.
pub trait ConfigProvider: Send + Sync + 'static {
    fn snapshot(&self) -> Arc<UploadConfig>;
}

/// Immutable configuration provider.
#[derive(Debug)]
pub struct StaticConfigProvider {
    inner: Arc<UploadConfig>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: Arc<UploadConfig>) -> Self {
        Self { inner: config }
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(UploadConfig::default()))
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn snapshot(&self) -> Arc<UploadConfig> {
        Arc::clone(&self.inner)
    }
}

/// Runtime-updatable configuration provider backed by `ArcSwap`.
#[derive(Debug)]
pub struct HotReloadConfigProvider {
    inner: ArcSwap<UploadConfig>,
}

impl HotReloadConfigProvider {
    #[must_use]
    pub fn new(config: Arc<UploadConfig>) -> Self {
        Self {
            inner: ArcSwap::from(config),
        }
    }

    /// Replaces the configuration atomically.
    pub fn update(&self, config: Arc<UploadConfig>) {
        self.inner.store(config);
    }
}

impl Default for HotReloadConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(UploadConfig::default()))
    }
}

impl ConfigProvider for HotReloadConfigProvider {
    fn snapshot(&self) -> Arc<UploadConfig> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = UploadLimits::default();
        assert_eq!(limits.file_size, 100 * 1024 * 1024);
        assert_eq!(limits.files, 10);
        assert_eq!(limits.fields, 100);
        assert_eq!(limits.field_size, 1024 * 1024);
        assert_eq!(limits.field_name_size, 100);
        assert_eq!(limits.header_size, 8 * 1024);
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticConfigProvider::default();
        let s1 = provider.snapshot();
        let s2 = provider.snapshot();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[test]
    fn test_hot_reload_snapshot_immutable() {
        let provider = HotReloadConfigProvider::default();
        let snapshot = provider.snapshot();

        let mut updated = UploadConfig::default();
        updated.limits.files = 3;
        provider.update(Arc::new(updated));

        assert_eq!(snapshot.limits.files, 10);
        assert_eq!(provider.snapshot().limits.files, 3);
    }

    #[test]
    fn test_serde_default_values() {
        let json = r#"{"limits": {"file_size": 1024}}"#;
        let config: UploadConfig = serde_json::from_str(json).expect("deserialize failed");
        assert_eq!(config.limits.file_size, 1024);
        assert_eq!(config.limits.files, 10);
    }
}
