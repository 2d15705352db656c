//! Unified configuration for the media repository core.
//!
//! One flattened settings struct instead of a struct per component. Values are read through
//! [`SettingsHandle::snapshot`] at the start of each operation, so configuration changes apply
//! on the next call without coordinating with in-flight work.
//!
//! Configuration file parsing and live reload live outside the core; whatever owns them calls
//! [`SettingsHandle::update`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Which origins this deployment is authoritative for.
///
/// Sourced from a configuration snapshot listing locally-hosted homeserver names, with
/// per-domain overrides taking precedence over the list.
#[derive(Debug, Clone, Default)]
pub struct OriginAuthority {
    local_names: HashSet<String>,
    overrides: HashMap<String, bool>,
}

impl OriginAuthority {
    /// Build from the list of locally-hosted homeserver names.
    pub fn new<I, S>(local_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local_names: local_names.into_iter().map(Into::into).collect(),
            overrides: HashMap::new(),
        }
    }

    /// Force a specific answer for one domain, regardless of the local-names list.
    #[must_use]
    pub fn with_override(mut self, domain: impl Into<String>, ours: bool) -> Self {
        self.overrides.insert(domain.into(), ours);
        self
    }

    /// Whether `origin` is hosted by this deployment.
    pub fn is_ours(&self, origin: &str) -> bool {
        if let Some(&forced) = self.overrides.get(origin) {
            return forced;
        }
        self.local_names.contains(origin)
    }
}

/// Flattened settings for the download core.
#[derive(Debug, Clone)]
pub struct RepoSettings {
    // ----------------------------
    // Quarantine policy
    // ----------------------------
    /// Serve a generated replacement artifact instead of failing quarantined downloads.
    /// Default: false.
    pub quarantine_replace_downloads: bool,

    /// Dimensions of the generated replacement artifact.
    /// Default: 512x512.
    pub quarantine_thumbnail_size: (u32, u32),

    // ----------------------------
    // Hot metadata cache
    // ----------------------------
    /// How long a record stays in the hot cache.
    /// Default: 30 seconds.
    pub hot_cache_ttl: Duration,

    /// How often expired hot-cache entries are swept.
    /// Default: 60 seconds.
    pub hot_cache_sweep: Duration,

    // ----------------------------
    // Remote fetching
    // ----------------------------
    /// Number of remote-fetch workers.
    /// Default: 4.
    pub fetch_workers: usize,

    /// Maximum number of retry attempts for transient upstream failures.
    /// Default: 3 retries.
    pub fetch_max_retries: u32,

    /// Base delay for exponential backoff between retries.
    /// Default: 100ms.
    pub fetch_retry_base_delay: Duration,

    /// Maximum backoff delay (cap for exponential growth).
    /// Default: 5 seconds.
    pub fetch_max_retry_delay: Duration,

    /// Timeout for opening the upstream download response.
    /// Default: 30 seconds.
    pub fetch_request_timeout: Duration,

    /// Upper bound on the size of a remotely-fetched blob. `None` disables the limit.
    /// Default: 100 MiB.
    pub max_remote_bytes: Option<u64>,

    /// URL scheme used to reach remote origins.
    /// Default: "https".
    pub transport_scheme: String,

    // ----------------------------
    // Origin authority
    // ----------------------------
    /// Which origins are locally hosted.
    pub authority: OriginAuthority,
}

impl Default for RepoSettings {
    fn default() -> Self {
        Self {
            quarantine_replace_downloads: false,
            quarantine_thumbnail_size: (512, 512),
            hot_cache_ttl: Duration::from_secs(30),
            hot_cache_sweep: Duration::from_secs(60),
            fetch_workers: 4,
            fetch_max_retries: 3,
            fetch_retry_base_delay: Duration::from_millis(100),
            fetch_max_retry_delay: Duration::from_secs(5),
            fetch_request_timeout: Duration::from_secs(30),
            max_remote_bytes: Some(100 * 1024 * 1024),
            transport_scheme: "https".into(),
            authority: OriginAuthority::default(),
        }
    }
}

/// Cheap cloneable handle over the current settings snapshot.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<RepoSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: RepoSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings. Taken once per operation.
    pub fn snapshot(&self) -> RepoSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Replace parts of the settings in place. Applies to subsequent calls.
    pub fn update(&self, f: impl FnOnce(&mut RepoSettings)) {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        f(&mut guard);
    }
}
