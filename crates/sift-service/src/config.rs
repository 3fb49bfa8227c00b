//! Filtering configuration.
//!
//! The host application owns the configuration file; this module only
//! describes the fields the filtering subsystem consumes. Every field has a
//! default so a partial JSON document is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

pub const DEFAULT_FILTER_LISTS: &[&str] = &[
    "https://easylist.to/easylist/easylist.txt",
    "https://easylist.to/easylist/easyprivacy.txt",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub auto_update: bool,
    pub filter_lists: Vec<String>,
    pub whitelist: Vec<String>,
    pub update_interval_secs: u64,
    pub cache_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub startup_delay_secs: u64,
    /// Scheme of the host's internal pages, always allowed
    pub internal_scheme: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_update: true,
            filter_lists: DEFAULT_FILTER_LISTS.iter().map(|s| s.to_string()).collect(),
            whitelist: Vec::new(),
            update_interval_secs: 24 * 60 * 60,
            cache_dir: default_cache_dir(),
            max_concurrent_downloads: 4,
            request_timeout_secs: 30,
            probe_timeout_secs: 10,
            startup_delay_secs: 120,
            internal_scheme: "dumb".to_string(),
        }
    }
}

impl FilterConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: &Path) -> Result<Self, FilterError> {
        let text = fs::read_to_string(path).map_err(|e| {
            FilterError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        let config: FilterConfig = serde_json::from_str(&text).map_err(|e| {
            FilterError::Config(format!("Failed to parse '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if self.max_concurrent_downloads == 0 {
            return Err(FilterError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.update_interval_secs == 0 {
            return Err(FilterError::Config(
                "update_interval_secs must be positive".to_string(),
            ));
        }
        if self.internal_scheme.is_empty()
            || !self
                .internal_scheme
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
        {
            return Err(FilterError::Config(format!(
                "invalid internal scheme '{}'",
                self.internal_scheme
            )));
        }
        for url in &self.filter_lists {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(FilterError::Config(format!(
                    "filter list '{}' is not an HTTP(S) URL",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sift")
        .join("filters")
}
