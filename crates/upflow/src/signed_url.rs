//! Signed upload URLs
//!
//! Issues and validates time-bounded, tamper-evident URLs. The signature
//! is a hex HMAC-SHA256 over the base URL and the lexicographically
//! sorted `key=value` list of every other query parameter. Validation
//! optionally records consumed signatures in a bounded replay cache so a
//! URL cannot be honored twice within its validity window.

use crate::UploadResult;
use crate::crypto;
use crate::lru::LruCache;
use crate::upload_error;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use url::Url;
use zeroize::Zeroizing;

/// HMAC secret, zeroized on drop and redacted in debug output.
pub struct SecretKey {
    inner: Zeroizing<String>,
}

impl SecretKey {
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.inner
    }
}

impl From<&str> for SecretKey {
    fn from(s: &str) -> Self {
        Self {
            inner: Zeroizing::new(s.to_owned()),
        }
    }
}

impl From<String> for SecretKey {
    fn from(s: String) -> Self {
        Self { inner: Zeroizing::new(s) }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// Signer configuration. The secret is supplied separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Validity window applied when `SignOptions::expires_in` is absent.
    /// Default: 3600 s.
    pub default_expiry_secs: u64,
    /// Whether validated signatures are recorded and refused on reuse.
    /// Default: true.
    pub replay_prevention: bool,
    /// Bound on the replay cache. Default: 10 000 signatures.
    pub replay_cache_size: usize,
    /// Interval for the background replay sweep. Default: 300 s.
    pub sweep_interval_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            default_expiry_secs: 3600,
            replay_prevention: true,
            replay_cache_size: 10_000,
            sweep_interval_secs: 300,
        }
    }
}

/// Options for [`UrlSigner::sign`].
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// Seconds until expiry; the signer default applies when absent.
    pub expires_in: Option<u64>,
    pub max_file_size: Option<u64>,
    pub max_files: Option<u32>,
    pub allowed_types: Option<Vec<String>>,
    pub user_id: Option<String>,
    /// Free-form entries, carried as `meta_<key>` parameters.
    pub metadata: HashMap<String, String>,
}

/// Constraints recovered from a validated URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadConstraints {
    pub max_file_size: Option<u64>,
    pub max_files: Option<u32>,
    pub allowed_types: Option<Vec<String>>,
    pub user_id: Option<String>,
}

/// Successful validation result.
#[derive(Debug)]
pub struct ValidatedUrl {
    pub constraints: UploadConstraints,
    pub metadata: HashMap<String, String>,
    /// Seconds until the URL expires.
    pub time_remaining: u64,
}

/// Map from consumed signature to its expiry epoch second.
pub struct ReplayCache {
    inner: Mutex<LruCache<String, i64>>,
}

impl ReplayCache {
    #[must_use]
    fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(max_size)),
        }
    }

    /// Records the signature unless it was already present.
    fn check_and_record(&self, signature: &str, expires: i64) -> bool {
        let mut cache = self.inner.lock().unwrap();
        if cache.contains(signature) {
            return false;
        }
        cache.insert(signature.to_owned(), expires);
        true
    }

    /// Drops entries whose URLs have expired, returning how many.
    pub fn sweep(&self) -> usize {
        let now = now_unix();
        let mut cache = self.inner.lock().unwrap();
        let before = cache.len();
        cache.retain(|_, &expires| expires >= now);
        before - cache.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issues and validates signed upload URLs.
pub struct UrlSigner {
    secret: SecretKey,
    config: SignerConfig,
    replay: Option<Arc<ReplayCache>>,
}

impl UrlSigner {
    #[must_use]
    pub fn new(secret: impl Into<SecretKey>) -> Self {
        Self::with_config(secret, SignerConfig::default())
    }

    #[must_use]
    pub fn with_config(secret: impl Into<SecretKey>, config: SignerConfig) -> Self {
        let replay = config.replay_prevention.then(|| Arc::new(ReplayCache::new(config.replay_cache_size)));
        Self {
            secret: secret.into(),
            config,
            replay,
        }
    }

    /// Spawns the periodic replay sweep on the current tokio runtime.
    ///
    /// The task holds only a `Weak` reference to the cache and exits once
    /// the signer is dropped, so it never keeps the process alive.
    /// Returns `None` when replay prevention is disabled.
    pub fn spawn_replay_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let replay = self.replay.as_ref()?;
        let weak = Arc::downgrade(replay);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let swept = cache.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "replay cache sweep");
                }
            }
        }))
    }

    /// Signs `base_url`, appending the constraint parameters and the
    /// `signature` parameter to its query.
    ///
    /// # Errors
    /// `SIGNED_URL_INVALID` when `base_url` is not a valid absolute URL.
    pub fn sign(&self, base_url: &str, opts: &SignOptions) -> UploadResult<String> {
        self.sign_at(base_url, opts, now_unix())
    }

    fn sign_at(&self, base_url: &str, opts: &SignOptions, now: i64) -> UploadResult<String> {
        let mut url =
            Url::parse(base_url).map_err(|e| upload_error!(e, SignedUrlInvalid, "invalid base url: {:?}", base_url))?;

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let expires = now + i64::try_from(opts.expires_in.unwrap_or(self.config.default_expiry_secs)).unwrap_or(i64::MAX);
        params.push(("expires".to_owned(), expires.to_string()));
        if let Some(v) = opts.max_file_size {
            params.push(("max_size".to_owned(), v.to_string()));
        }
        if let Some(v) = opts.max_files {
            params.push(("max_files".to_owned(), v.to_string()));
        }
        if let Some(ref v) = opts.user_id {
            params.push(("user_id".to_owned(), v.clone()));
        }
        if let Some(ref types) = opts.allowed_types
            && !types.is_empty()
        {
            params.push(("allowed_types".to_owned(), types.join(",")));
        }
        let mut meta: Vec<_> = opts.metadata.iter().collect();
        meta.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in meta {
            params.push((format!("meta_{k}"), v.clone()));
        }

        let base = url[..url::Position::AfterPath].to_owned();
        let signature = self.compute_signature(&base, &params);

        url.set_query(None);
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in &params {
                qp.append_pair(k, v);
            }
            qp.append_pair("signature", &signature);
        }
        Ok(url.into())
    }

    /// Validates a signed URL.
    ///
    /// Checks, in order: signature present, signature matches, expiry
    /// parseable and in the future, signature not already consumed. A
    /// successful validation records the signature in the replay cache.
    pub fn validate(&self, signed_url: &str) -> UploadResult<ValidatedUrl> {
        self.validate_at(signed_url, now_unix())
    }

    fn validate_at(&self, signed_url: &str, now: i64) -> UploadResult<ValidatedUrl> {
        let url =
            Url::parse(signed_url).map_err(|e| upload_error!(e, SignedUrlInvalid, "invalid url: {:?}", signed_url))?;

        let mut params: Vec<(String, String)> = Vec::new();
        let mut provided_signature = None;
        for (k, v) in url.query_pairs() {
            if k == "signature" {
                provided_signature = Some(v.into_owned());
            } else {
                params.push((k.into_owned(), v.into_owned()));
            }
        }
        let provided_signature =
            provided_signature.ok_or_else(|| upload_error!(SignedUrlMissingSignature, "url has no signature parameter"))?;

        let base = url[..url::Position::AfterPath].to_owned();
        let expected = self.compute_signature(&base, &params);
        let matches: bool = expected.as_bytes().ct_eq(provided_signature.as_bytes()).into();
        if !matches {
            return Err(upload_error!(SignedUrlInvalid, "signature mismatch"));
        }

        let expires = params
            .iter()
            .find(|(k, _)| k == "expires")
            .and_then(|(_, v)| v.parse::<i64>().ok())
            .ok_or_else(|| upload_error!(SignedUrlInvalid, "expires missing or unparseable"))?;
        if now > expires {
            return Err(upload_error!(SignedUrlExpired, "url expired {} seconds ago", now - expires));
        }

        if let Some(ref replay) = self.replay
            && !replay.check_and_record(&provided_signature, expires)
        {
            return Err(upload_error!(SignedUrlReplayed, "signature was already used"));
        }

        let mut constraints = UploadConstraints::default();
        let mut metadata = HashMap::new();
        for (k, v) in &params {
            match k.as_str() {
                "max_size" => constraints.max_file_size = v.parse().ok(),
                "max_files" => constraints.max_files = v.parse().ok(),
                "user_id" => constraints.user_id = Some(v.clone()),
                "allowed_types" => {
                    constraints.allowed_types = Some(v.split(',').map(str::to_owned).collect());
                }
                _ => {
                    if let Some(name) = k.strip_prefix("meta_") {
                        metadata.insert(name.to_owned(), v.clone());
                    }
                }
            }
        }

        Ok(ValidatedUrl {
            constraints,
            metadata,
            time_remaining: u64::try_from(expires - now).unwrap_or(0),
        })
    }

    fn compute_signature(&self, base: &str, params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut canonical = String::with_capacity(base.len() + 1 + sorted.len() * 16);
        canonical.push_str(base);
        canonical.push('?');
        for (i, (k, v)) in sorted.iter().enumerate() {
            if i > 0 {
                canonical.push('&');
            }
            canonical.push_str(k);
            canonical.push('=');
            canonical.push_str(v);
        }
        crypto::hex_hmac_sha256(self.secret.expose().as_bytes(), canonical.as_bytes())
    }
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UploadErrorCode;

    fn signer() -> UrlSigner {
        UrlSigner::new("test-secret")
    }

    #[test]
    fn sign_then_validate() {
        let signer = signer();
        let opts = SignOptions {
            expires_in: Some(60),
            max_file_size: Some(10),
            ..SignOptions::default()
        };
        let url = signer.sign("https://example.com/upload", &opts).unwrap();
        assert!(url.contains("signature="));
        assert!(url.contains("max_size=10"));

        let validated = signer.validate(&url).unwrap();
        assert_eq!(validated.constraints.max_file_size, Some(10));
        assert!(validated.time_remaining <= 60);
    }

    #[test]
    fn constraints_and_metadata_round_trip() {
        let signer = signer();
        let mut metadata = HashMap::new();
        metadata.insert("purpose".to_owned(), "avatar".to_owned());
        metadata.insert("tenant".to_owned(), "acme".to_owned());
        let opts = SignOptions {
            expires_in: Some(120),
            max_files: Some(3),
            allowed_types: Some(vec!["image/png".to_owned(), "image/jpeg".to_owned()]),
            user_id: Some("user-7".to_owned()),
            metadata,
            ..SignOptions::default()
        };
        let url = signer.sign("https://example.com/upload", &opts).unwrap();
        let validated = signer.validate(&url).unwrap();

        assert_eq!(validated.constraints.max_files, Some(3));
        assert_eq!(validated.constraints.user_id.as_deref(), Some("user-7"));
        assert_eq!(
            validated.constraints.allowed_types,
            Some(vec!["image/png".to_owned(), "image/jpeg".to_owned()])
        );
        assert_eq!(validated.metadata.get("purpose").map(String::as_str), Some("avatar"));
        assert_eq!(validated.metadata.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn tampered_url_is_rejected() {
        let signer = signer();
        let opts = SignOptions {
            expires_in: Some(60),
            max_file_size: Some(10),
            ..SignOptions::default()
        };
        let url = signer.sign("https://example.com/upload", &opts).unwrap();
        let tampered = url.replace("max_size=10", "max_size=999999");
        let err = signer.validate(&tampered).unwrap_err();
        assert_eq!(err.code(), UploadErrorCode::SignedUrlInvalid);
    }

    #[test]
    fn missing_signature() {
        let err = signer().validate("https://example.com/upload?expires=99").unwrap_err();
        assert_eq!(err.code(), UploadErrorCode::SignedUrlMissingSignature);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let url = signer()
            .sign("https://example.com/upload", &SignOptions::default())
            .unwrap();
        let other = UrlSigner::new("different-secret");
        let err = other.validate(&url).unwrap_err();
        assert_eq!(err.code(), UploadErrorCode::SignedUrlInvalid);
    }

    #[test]
    fn expired_url_is_rejected() {
        let signer = signer();
        let now = now_unix();
        let url = signer
            .sign_at("https://example.com/upload", &SignOptions { expires_in: Some(60), ..SignOptions::default() }, now)
            .unwrap();
        let err = signer.validate_at(&url, now + 61).unwrap_err();
        assert_eq!(err.code(), UploadErrorCode::SignedUrlExpired);

        let ok = signer.validate_at(&url, now + 59).unwrap();
        assert!(ok.time_remaining <= 60);
    }

    #[test]
    fn replay_is_rejected_within_expiry() {
        let signer = signer();
        let url = signer
            .sign("https://example.com/upload", &SignOptions { expires_in: Some(60), ..SignOptions::default() })
            .unwrap();
        signer.validate(&url).unwrap();
        let err = signer.validate(&url).unwrap_err();
        assert_eq!(err.code(), UploadErrorCode::SignedUrlReplayed);
    }

    #[test]
    fn replay_prevention_can_be_disabled() {
        let signer = UrlSigner::with_config(
            "test-secret",
            SignerConfig {
                replay_prevention: false,
                ..SignerConfig::default()
            },
        );
        let url = signer
            .sign("https://example.com/upload", &SignOptions::default())
            .unwrap();
        signer.validate(&url).unwrap();
        signer.validate(&url).unwrap();
    }

    #[test]
    fn existing_query_parameters_are_signed() {
        let signer = signer();
        let url = signer
            .sign("https://example.com/upload?bucket=photos", &SignOptions::default())
            .unwrap();
        let validated = signer.validate(&url).unwrap();
        assert_eq!(validated.constraints, UploadConstraints::default());

        let tampered = url.replace("bucket=photos", "bucket=secrets");
        assert!(signer.validate(&tampered).is_err());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let signer = signer();
        let now = now_unix();
        let url = signer
            .sign_at("https://example.com/a", &SignOptions { expires_in: Some(1), ..SignOptions::default() }, now - 10)
            .unwrap();
        // expired nine seconds ago, but validated back then
        signer.validate_at(&url, now - 9).unwrap();
        let replay = signer.replay.as_ref().unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay.sweep(), 1);
        assert!(replay.is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_stops_when_signer_dropped() {
        let signer = UrlSigner::with_config(
            "s",
            SignerConfig {
                sweep_interval_secs: 1,
                ..SignerConfig::default()
            },
        );
        let handle = signer.spawn_replay_sweeper().unwrap();
        drop(signer);
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("sweeper should exit after the signer is dropped")
            .unwrap();
    }
}
