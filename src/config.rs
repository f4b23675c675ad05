use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Overrides the default cache location.
pub const CACHE_DIR_ENV: &str = "MPR_VOLUME_CACHE_DIR";

const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Cache location and eviction limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Upper bound on stored pixel bytes across all namespaces.
    pub max_bytes: u64,
    /// Entries not accessed for this long are evicted. `None` keeps them.
    #[serde(rename = "max_age_secs", with = "duration_secs")]
    pub max_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_bytes: DEFAULT_MAX_BYTES,
            max_age: Some(DEFAULT_MAX_AGE),
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// First of `$MPR_VOLUME_CACHE_DIR`, `$XDG_CACHE_HOME/mpr-volume`,
/// `$HOME/.cache/mpr-volume`, or the system temp dir.
pub fn default_cache_root() -> PathBuf {
    let from_env = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from);
    from_env(CACHE_DIR_ENV)
        .or_else(|| from_env("XDG_CACHE_HOME").map(|p| p.join("mpr-volume")))
        .or_else(|| from_env("HOME").map(|p| p.join(".cache").join("mpr-volume")))
        .unwrap_or_else(|| std::env::temp_dir().join("mpr-volume"))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
