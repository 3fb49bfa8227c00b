use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::FilterConfig;
use crate::fetch::{FetchError, SourceFetcher};
use crate::manager::FilterManager;
use crate::store::FileFilterStore;

pub const LIST_A: &str = "https://lists.example/a.txt";
pub const LIST_B: &str = "https://lists.example/b.txt";

#[derive(Clone)]
struct MockSource {
    body: Vec<u8>,
    /// Token served by probes; `None` makes probes fail
    token: Option<String>,
    fail: bool,
}

/// Scripted fetcher that counts every call.
#[derive(Default)]
pub struct MockFetcher {
    sources: Mutex<HashMap<String, MockSource>>,
    downloads: Mutex<HashMap<String, usize>>,
    probes: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body`, probing to its `! Version:` marker.
    pub fn serve(&self, url: &str, body: &str) {
        let token = sift_compiler::extract_version(body.as_bytes());
        self.sources.lock().unwrap().insert(
            url.to_string(),
            MockSource {
                body: body.as_bytes().to_vec(),
                token,
                fail: false,
            },
        );
    }

    /// Serve `body` with a fixed probe token, like a server ETag.
    pub fn serve_with_token(&self, url: &str, body: &str, token: &str) {
        self.sources.lock().unwrap().insert(
            url.to_string(),
            MockSource {
                body: body.as_bytes().to_vec(),
                token: Some(token.to_string()),
                fail: false,
            },
        );
    }

    pub fn fail(&self, url: &str) {
        self.sources.lock().unwrap().insert(
            url.to_string(),
            MockSource {
                body: Vec::new(),
                token: None,
                fail: true,
            },
        );
    }

    pub fn downloads(&self, url: &str) -> usize {
        self.downloads.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().unwrap().values().sum()
    }

    pub fn probes(&self, url: &str) -> usize {
        self.probes.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn source(&self, url: &str) -> Option<MockSource> {
        self.sources.lock().unwrap().get(url).cloned()
    }
}

#[async_trait::async_trait]
impl SourceFetcher for MockFetcher {
    async fn probe_version(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        *self.probes.lock().unwrap().entry(url.to_string()).or_default() += 1;
        match self.source(url) {
            Some(source) if source.fail => Err(FetchError::Status(503)),
            Some(source) => source.token.ok_or(FetchError::NoVersion),
            None => Err(FetchError::Status(404)),
        }
    }

    async fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        *self.downloads.lock().unwrap().entry(url.to_string()).or_default() += 1;
        match self.source(url) {
            Some(source) if source.fail => Err(FetchError::Status(503)),
            Some(source) => Ok(source.body),
            None => Err(FetchError::Status(404)),
        }
    }
}

pub fn test_config(dir: &std::path::Path, lists: &[&str]) -> FilterConfig {
    FilterConfig {
        auto_update: false,
        filter_lists: lists.iter().map(|s| s.to_string()).collect(),
        cache_dir: dir.to_path_buf(),
        max_concurrent_downloads: 2,
        startup_delay_secs: 0,
        ..FilterConfig::default()
    }
}

pub fn manager_with(config: FilterConfig, fetcher: &Arc<MockFetcher>) -> Arc<FilterManager> {
    let store = Arc::new(FileFilterStore::new(config.cache_dir.clone()));
    let fetcher: Arc<dyn SourceFetcher> = fetcher.clone();
    Arc::new(FilterManager::new(config, store, fetcher))
}

/// Patterns of the network rules currently live.
pub async fn live_patterns(manager: &FilterManager) -> Vec<String> {
    manager
        .active_filters()
        .await
        .map(|set| set.network_rules.iter().map(|r| r.url_pattern.clone()).collect())
        .unwrap_or_default()
}
