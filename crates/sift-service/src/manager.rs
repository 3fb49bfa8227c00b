//! Filter lifecycle
//!
//! The manager owns two filter sets:
//!
//! - `base`: the merged content of every subscription, exactly as compiled.
//!   This is what gets cached and what update deltas are applied to.
//! - `active`: `base` plus the overlay (whitelist, fixed rules, anti-loader
//!   selectors). This is what the content-blocking engine and the cosmetic
//!   injector see.
//!
//! Every mutation happens under the state writer lock; readers clone the
//! `Arc` of the active set and never observe a partially applied update.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sift_compiler::{compile_snapshot, extract_version, FilterDelta};
use sift_core::domain::normalize_domain;
use sift_core::{list_id, CompiledFilterSet};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FilterConfig;
use crate::engine::{ContentBlockingEngine, FILTER_IDENTIFIER};
use crate::error::FilterError;
use crate::fetch::{FetchError, HttpFetcher, SourceFetcher};
use crate::injector::CosmeticInjector;
use crate::overlay::{build_effective, WhitelistCache};
use crate::status::{FilterState, StatusBus, StatusEvent, SubscriptionId};
use crate::store::{FileFilterStore, FilterStore, StoreError};
use crate::updater::FilterUpdater;

struct ManagerState {
    enabled: bool,
    base: Option<Arc<CompiledFilterSet>>,
    active: Option<Arc<CompiledFilterSet>>,
    whitelist: Vec<String>,
    whitelist_cache: WhitelistCache,
}

/// One downloaded and compiled subscription.
pub(crate) struct CompiledSource {
    pub set: CompiledFilterSet,
    pub body: Vec<u8>,
    pub version: Option<String>,
}

pub struct FilterManager {
    config: FilterConfig,
    store: Arc<dyn FilterStore>,
    fetcher: Arc<dyn SourceFetcher>,
    injector: CosmeticInjector,
    status: StatusBus,
    state: RwLock<ManagerState>,
    /// Held by whichever full refresh or update cycle is running
    update_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl FilterManager {
    pub fn new(
        config: FilterConfig,
        store: Arc<dyn FilterStore>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let mut whitelist = Vec::new();
        for domain in &config.whitelist {
            match normalize_domain(domain) {
                Some(domain) if !whitelist.contains(&domain) => whitelist.push(domain),
                Some(_) => {}
                None => log::warn!("Ignoring invalid whitelist entry '{}'", domain),
            }
        }

        Self {
            store,
            fetcher,
            injector: CosmeticInjector::new(),
            status: StatusBus::new(),
            state: RwLock::new(ManagerState {
                enabled: config.enabled,
                base: None,
                active: None,
                whitelist,
                whitelist_cache: WhitelistCache::new(),
            }),
            update_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Manager backed by the on-disk store in `config.cache_dir` and HTTP downloads.
    pub fn with_defaults(config: FilterConfig) -> Result<Arc<Self>, FilterError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(config.request_timeout(), config.probe_timeout())
            .map_err(|e| FilterError::Config(format!("HTTP client: {e}")))?;
        let store = FileFilterStore::new(config.cache_dir.clone());
        Ok(Arc::new(Self::new(config, Arc::new(store), Arc::new(fetcher))))
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn FilterStore> {
        &self.store
    }

    pub(crate) fn fetcher(&self) -> &Arc<dyn SourceFetcher> {
        &self.fetcher
    }

    pub fn injector(&self) -> &CosmeticInjector {
        &self.injector
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load cached filters, or compile them from the subscriptions when no
    /// usable cache exists. Returns the resulting state.
    pub async fn initialize(self: &Arc<Self>) -> FilterState {
        if !self.state.read().await.enabled {
            self.injector.set_enabled(false);
            self.publish(FilterState::Disabled, "Content filtering disabled", "");
            return FilterState::Disabled;
        }
        self.load().await
    }

    async fn load(self: &Arc<Self>) -> FilterState {
        self.publish(FilterState::Loading, "Loading filters", "");

        let store = Arc::clone(&self.store);
        let cached = tokio::task::spawn_blocking(move || store.load_cached()).await;

        match cached {
            Ok(Ok(set)) => {
                log::info!("Loaded {} cached rules (version {})", set.rule_count(), set.version);
                self.install(set).await;
                self.publish_active("Filters loaded from cache").await;

                if self.config.auto_update && self.cache_is_stale() {
                    log::info!("Cached filters are stale, checking for updates");
                    let updater = self.updater();
                    tokio::spawn(async move {
                        updater.check_and_update(true).await;
                    });
                }
            }
            Ok(Err(StoreError::NotFound)) => {
                log::info!("No cached filters, compiling from sources");
                self.compile_or_report().await;
            }
            Ok(Err(e)) => {
                log::warn!("Discarding unusable filter cache: {}", e);
                self.compile_or_report().await;
            }
            Err(e) => {
                log::error!("Cache load task failed: {}", e);
                self.compile_or_report().await;
            }
        }

        self.status().state
    }

    async fn compile_or_report(self: &Arc<Self>) {
        if let Err(e) = self.refresh_from_sources().await {
            log::warn!("Filter compilation failed: {}", e);
        }
    }

    fn cache_is_stale(&self) -> bool {
        let interval = chrono::Duration::from_std(self.config.update_interval())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let freshest = [self.store.cache_info().modified, self.store.last_check_time()]
            .into_iter()
            .flatten()
            .max();
        match freshest {
            Some(at) => Utc::now() - at > interval,
            None => true,
        }
    }

    /// Download and compile every subscription from scratch.
    ///
    /// On a cold start each list goes live as soon as it is compiled. When
    /// filters are already active they stay in place until every list has
    /// been compiled, and a partial failure keeps them.
    pub async fn refresh_from_sources(self: &Arc<Self>) -> Result<usize, FilterError> {
        let guard = self.update_lock.lock().await;
        self.refresh_locked(&guard).await
    }

    pub(crate) async fn lock_updates(&self) -> MutexGuard<'_, ()> {
        self.update_lock.lock().await
    }

    pub(crate) async fn refresh_locked(
        self: &Arc<Self>,
        _guard: &MutexGuard<'_, ()>,
    ) -> Result<usize, FilterError> {
        let sources = unique_sources(&self.config);
        if sources.is_empty() {
            let err = FilterError::Config("No filter lists configured".to_string());
            self.report_failure(&err).await;
            return Err(err);
        }

        let had_filters = self.has_filters().await;
        let total = sources.len();
        log::info!("Compiling {} filter lists", total);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_downloads));
        let (tx, mut rx) = mpsc::channel(total);
        for url in sources {
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => compile_source(fetcher.as_ref(), &url, &cancel).await,
                    Err(_) => Err(FilterError::Cancelled),
                };
                let _ = tx.send((url, result)).await;
            });
        }
        drop(tx);

        let mut merged = CompiledFilterSet::new(format!("compiled-{}", Utc::now().timestamp()));
        let mut compiled = Vec::new();
        let mut last_error = None;

        while let Some((url, result)) = rx.recv().await {
            match result {
                Ok(source) => {
                    merged.merge(source.set);
                    compiled.push((url, source.body, source.version));
                    if !had_filters {
                        self.install(merged.clone()).await;
                        self.publish_active(&format!(
                            "Compiled {} of {} filter lists",
                            compiled.len(),
                            total
                        ))
                        .await;
                    }
                }
                Err(e) => {
                    log::warn!("Failed to compile {}: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(FilterError::Cancelled);
        }

        if compiled.is_empty() {
            let err = last_error
                .unwrap_or_else(|| FilterError::InvalidFormat("no rules compiled".to_string()));
            self.report_failure(&err).await;
            return Err(err);
        }

        if had_filters && compiled.len() < total {
            let err = last_error
                .unwrap_or_else(|| FilterError::InvalidFormat("incomplete refresh".to_string()));
            log::warn!(
                "Only {} of {} lists refreshed, keeping current filters",
                compiled.len(),
                total
            );
            self.report_failure(&err).await;
            return Err(err);
        }

        let count = merged.rule_count();
        let base = self.install(merged).await;
        self.persist(base).await;

        for (url, body, version) in compiled {
            if let Err(e) = self.store.save_snapshot(&list_id(&url), &body) {
                log::warn!("Failed to save snapshot of {}: {}", url, e);
                continue;
            }
            if let Some(version) = version {
                if let Err(e) = self.store.set_source_version(&url, &version) {
                    log::warn!("Failed to record version of {}: {}", url, e);
                }
            }
        }
        if let Err(e) = self.store.retain_sources(&unique_sources(&self.config)) {
            log::warn!("Failed to prune stale sources: {}", e);
        }
        if let Err(e) = self.store.touch_last_check() {
            log::warn!("Failed to record check time: {}", e);
        }

        self.publish_active("Filters active").await;
        Ok(count)
    }

    /// Start the background update loop. Returns `None` when auto-update is off.
    pub fn start_update_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.auto_update {
            log::info!("Automatic filter updates disabled");
            return None;
        }

        let updater = self.updater();
        let cancel = self.cancel.clone();
        let delay = self.config.startup_delay();
        let interval = self.config.update_interval();

        Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            loop {
                let report = updater.check_and_update(false).await;
                log::debug!("Update cycle finished: {:?}", report);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            log::debug!("Filter update loop stopped");
        }))
    }

    pub fn updater(self: &Arc<Self>) -> FilterUpdater {
        FilterUpdater::new(Arc::clone(self))
    }

    /// Cancel in-flight downloads and stop the update loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn enable(self: &Arc<Self>) -> FilterState {
        {
            let mut state = self.state.write().await;
            if state.enabled {
                return self.status().state;
            }
            state.enabled = true;
        }
        self.injector.set_enabled(true);

        if self.has_filters().await {
            self.publish_active("Content filtering enabled").await;
            FilterState::Active
        } else {
            self.load().await
        }
    }

    pub async fn disable(&self) {
        self.state.write().await.enabled = false;
        self.injector.set_enabled(false);
        self.publish(FilterState::Disabled, "Content filtering disabled", "");
    }

    /// Drop every rule and the on-disk cache.
    pub async fn clear(&self) -> Result<(), FilterError> {
        {
            let mut state = self.state.write().await;
            state.base = None;
            state.active = None;
        }
        self.injector.inject_rules(BTreeMap::new());
        self.store.invalidate()?;
        self.publish(FilterState::Uninitialized, "Filters cleared", "");
        Ok(())
    }

    // =========================================================================
    // Applying rules
    // =========================================================================

    /// Replace the subscription content and rebuild the active set.
    async fn install(&self, base: CompiledFilterSet) -> Arc<CompiledFilterSet> {
        let base = Arc::new(base);
        let mut state = self.state.write().await;
        state.base = Some(Arc::clone(&base));
        self.rebuild_active(&mut state);
        base
    }

    /// Apply an update delta to the subscription content. Fails when no
    /// subscription content is held, since the delta alone is not a list.
    pub(crate) async fn apply_delta(
        &self,
        delta: FilterDelta,
    ) -> Result<Arc<CompiledFilterSet>, FilterError> {
        let mut state = self.state.write().await;
        let Some(mut base) = state.base.take() else {
            return Err(FilterError::NotReady);
        };

        let target = Arc::make_mut(&mut base);
        let removed = delta.apply_to(target);
        target.compiled_at = Utc::now();
        target.version = format!("updated-{}", target.compiled_at.timestamp());
        log::debug!("Delta removed {} rules, base now has {}", removed, target.rule_count());

        state.base = Some(Arc::clone(&base));
        self.rebuild_active(&mut state);
        Ok(base)
    }

    fn rebuild_active(&self, state: &mut ManagerState) {
        let Some(base) = state.base.clone() else {
            state.active = None;
            self.injector.inject_rules(BTreeMap::new());
            return;
        };

        let whitelist_rules = state.whitelist_cache.rules_for(&state.whitelist);
        let effective = build_effective(&base, whitelist_rules, &self.config.internal_scheme);

        let mut cosmetic = effective.cosmetic_rules.to_map();
        if !effective.generic_hiding.is_empty() {
            cosmetic.insert(String::new(), effective.generic_hiding.clone());
        }
        self.injector.inject_rules(cosmetic);

        log::info!(
            "Applying filters: {} network rules, {} cosmetic domains, {} generic hiding rules",
            effective.network_len(),
            effective.cosmetic_rules.domain_count(),
            effective.generic_hiding.len()
        );
        state.active = Some(Arc::new(effective));
    }

    /// Write `base` to the cache. Failures leave the in-memory rules live.
    pub(crate) async fn persist(&self, base: Arc<CompiledFilterSet>) -> bool {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save_cache(&base)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Failed to persist filter cache: {}", e);
                false
            }
            Err(e) => {
                log::warn!("Cache write task failed: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn is_enabled(&self) -> bool {
        self.state.read().await.enabled
    }

    pub async fn has_filters(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    pub(crate) async fn has_base(&self) -> bool {
        self.state.read().await.base.is_some()
    }

    pub async fn active_filters(&self) -> Option<Arc<CompiledFilterSet>> {
        self.state.read().await.active.clone()
    }

    /// Network rules in the content-blocking engine's JSON format.
    pub async fn network_payload(&self) -> Result<Vec<u8>, FilterError> {
        let active = self.active_filters().await.ok_or(FilterError::NotReady)?;
        Ok(active.to_content_blocker_json()?)
    }

    /// Compile the current payload into `engine`. Returns the rule count.
    pub async fn publish_to(&self, engine: &dyn ContentBlockingEngine) -> Result<usize, FilterError> {
        let active = self.active_filters().await.ok_or(FilterError::NotReady)?;
        let payload = active.to_content_blocker_json()?;
        engine.compile(FILTER_IDENTIFIER, payload).await?;
        Ok(active.network_len())
    }

    pub fn cosmetic_rules_for_domain(&self, domain: &str) -> Vec<String> {
        self.injector.rules_for_domain(domain)
    }

    pub fn cosmetic_script_for_domain(&self, domain: &str) -> String {
        self.injector.script_for_domain(domain)
    }

    /// Add selectors at runtime. They live until the next rebuild.
    pub fn update_cosmetic_rules(&self, domain: &str, selectors: &[String]) {
        self.injector.update_rules_for_domain(domain, selectors);
    }

    pub fn cosmetic_update_script(&self, selectors: &[String]) -> String {
        self.injector.update_script(selectors)
    }

    pub fn cosmetic_cleanup_script(&self) -> &'static str {
        self.injector.cleanup_script()
    }

    // =========================================================================
    // Whitelist
    // =========================================================================

    pub async fn whitelist(&self) -> Vec<String> {
        self.state.read().await.whitelist.clone()
    }

    /// Returns false if `domain` was already whitelisted.
    pub async fn add_to_whitelist(&self, domain: &str) -> Result<bool, FilterError> {
        let domain = normalize_domain(domain)
            .ok_or_else(|| FilterError::Config(format!("invalid domain '{domain}'")))?;
        let mut state = self.state.write().await;
        if state.whitelist.contains(&domain) {
            return Ok(false);
        }
        log::info!("Whitelisting {}", domain);
        state.whitelist.push(domain);
        self.rebuild_active(&mut state);
        Ok(true)
    }

    /// Returns false if `domain` was not whitelisted.
    pub async fn remove_from_whitelist(&self, domain: &str) -> Result<bool, FilterError> {
        let domain = normalize_domain(domain)
            .ok_or_else(|| FilterError::Config(format!("invalid domain '{domain}'")))?;
        let mut state = self.state.write().await;
        let before = state.whitelist.len();
        state.whitelist.retain(|d| d != &domain);
        if state.whitelist.len() == before {
            return Ok(false);
        }
        log::info!("Removed {} from whitelist", domain);
        self.rebuild_active(&mut state);
        Ok(true)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> StatusEvent {
        self.status.current()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.status.subscribe(callback)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<StatusEvent>) {
        self.status.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.unsubscribe(id)
    }

    fn publish(&self, state: FilterState, message: &str, version: &str) {
        self.status.publish(StatusEvent::new(state, message, version));
    }

    pub(crate) async fn publish_active(&self, message: &str) {
        let (enabled, active) = {
            let state = self.state.read().await;
            (state.enabled, state.active.clone())
        };
        if !enabled {
            return;
        }
        if let Some(active) = active {
            self.publish(
                FilterState::Active,
                &format!("{} ({} rules)", message, active.rule_count()),
                &active.version,
            );
        }
    }

    /// A failed update never takes working filters away.
    pub(crate) async fn report_failure(&self, err: &FilterError) {
        if !self.state.read().await.enabled {
            return;
        }
        if self.has_filters().await {
            self.publish_active(&format!("Update failed, keeping current filters: {err}"))
                .await;
        } else {
            self.publish(FilterState::Error, &err.to_string(), "");
        }
    }
}

pub(crate) async fn compile_source(
    fetcher: &dyn SourceFetcher,
    url: &str,
    cancel: &CancellationToken,
) -> Result<CompiledSource, FilterError> {
    let body = fetcher
        .download(url, cancel)
        .await
        .map_err(|e| FilterError::network(url, e))?;
    let version = match extract_version(&body) {
        Some(version) => Some(version),
        // Without a marker the server's validator is the only cheap token
        None => match fetcher.probe_version(url, cancel).await {
            Ok(token) => Some(token),
            Err(FetchError::Cancelled) => return Err(FilterError::Cancelled),
            Err(e) => {
                log::debug!("No version token for {}: {}", url, e);
                None
            }
        },
    };

    let (set, stats, body) = tokio::task::spawn_blocking(move || {
        let (set, stats) = compile_snapshot(&String::from_utf8_lossy(&body));
        (set, stats, body)
    })
    .await
    .map_err(|e| FilterError::InvalidFormat(format!("parser task failed: {e}")))?;

    log::info!(
        "Parsed {}: {} lines, {} network, {} cosmetic, {} ignored, {} invalid",
        url,
        stats.lines,
        stats.network,
        stats.cosmetic,
        stats.ignored,
        stats.invalid
    );

    if set.is_empty() {
        return Err(FilterError::InvalidFormat(format!("{url} produced no rules")));
    }
    Ok(CompiledSource { set, body, version })
}

/// Configured sources, deduplicated in order.
pub(crate) fn unique_sources(config: &FilterConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    config
        .filter_lists
        .iter()
        .filter(|url| seen.insert(url.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FileExportEngine;
    use crate::testing::{live_patterns, manager_with, test_config, MockFetcher, LIST_A, LIST_B};

    const EASY_A: &str = "[Adblock Plus 2.0]\n! Version: 1\n||ads.example^\nexample.com##.banner\n##.sponsored\n";
    const EASY_B: &str = "! Version: 7\n||tracker.example^$third-party\n@@||tracker.example/ok.js\n";

    fn has_pattern(patterns: &[String], needle: &str) -> bool {
        patterns.iter().any(|p| p.contains(needle))
    }

    #[tokio::test]
    async fn payload_before_initialize_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);

        assert_eq!(manager.status().state, FilterState::Uninitialized);
        assert!(matches!(manager.network_payload().await, Err(FilterError::NotReady)));
    }

    #[tokio::test]
    async fn cold_start_compiles_sources() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        fetcher.serve(LIST_B, EASY_B);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);
        let (_id, mut events) = manager.subscribe_channel();

        assert_eq!(manager.initialize().await, FilterState::Active);

        let patterns = live_patterns(&manager).await;
        assert!(has_pattern(&patterns, "ads\\.example"));
        assert!(has_pattern(&patterns, "tracker\\.example"));
        assert_eq!(patterns.last().map(String::as_str), Some("^dumb://"));

        assert_eq!(
            manager.cosmetic_rules_for_domain("www.example.com"),
            manager.injector().rules_for_domain("www.example.com")
        );
        let rules = manager.cosmetic_rules_for_domain("www.example.com");
        assert!(rules.contains(&".sponsored".to_string()));
        assert!(rules.contains(&".banner".to_string()));
        assert!(rules.contains(&".ad-loading".to_string()));

        let payload: serde_json::Value =
            serde_json::from_slice(&manager.network_payload().await.unwrap()).unwrap();
        assert!(payload.as_array().unwrap().len() >= 4);

        assert_eq!(events.recv().await.unwrap().state, FilterState::Loading);
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().state, FilterState::Active);

        // Cache, snapshots and versions are written
        let store = FileFilterStore::new(dir.path());
        assert!(store.cache_info().exists);
        assert_eq!(store.source_version(LIST_A).as_deref(), Some("1"));
        assert!(store.load_snapshot(&list_id(LIST_B)).unwrap().is_some());
        assert!(store.last_check_time().is_some());
    }

    #[tokio::test]
    async fn cache_hit_skips_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let first = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        first.initialize().await;
        assert_eq!(fetcher.total_downloads(), 1);

        fetcher.fail(LIST_A);
        let second = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        assert_eq!(second.initialize().await, FilterState::Active);
        assert_eq!(fetcher.total_downloads(), 1);
        assert!(has_pattern(&live_patterns(&second).await, "ads\\.example"));
    }

    #[tokio::test]
    async fn corrupted_cache_is_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        manager_with(test_config(dir.path(), &[LIST_A]), &fetcher)
            .initialize()
            .await;

        let path = dir.path().join("filters.json");
        let mut data = std::fs::read(&path).unwrap();
        data[0] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        assert_eq!(manager.initialize().await, FilterState::Active);
        assert_eq!(fetcher.downloads(LIST_A), 2);
    }

    #[tokio::test]
    async fn all_sources_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.fail(LIST_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);

        assert_eq!(manager.initialize().await, FilterState::Error);
        assert!(matches!(manager.network_payload().await, Err(FilterError::NotReady)));
    }

    #[tokio::test]
    async fn no_lists_configured_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let manager = manager_with(test_config(dir.path(), &[]), &fetcher);

        assert_eq!(manager.initialize().await, FilterState::Error);
        assert!(manager.status().message.contains("No filter lists"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_active_filters() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        fetcher.serve(LIST_B, EASY_B);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);
        manager.initialize().await;
        let before = live_patterns(&manager).await;

        fetcher.fail(LIST_B);
        assert!(manager.refresh_from_sources().await.is_err());

        assert_eq!(manager.status().state, FilterState::Active);
        assert_eq!(live_patterns(&manager).await, before);
    }

    #[tokio::test]
    async fn partial_cold_start_goes_live() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        fetcher.fail(LIST_B);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);

        assert_eq!(manager.initialize().await, FilterState::Active);
        assert!(has_pattern(&live_patterns(&manager).await, "ads\\.example"));
    }

    #[tokio::test]
    async fn disable_and_enable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        manager.disable().await;
        assert_eq!(manager.status().state, FilterState::Disabled);
        assert_eq!(manager.cosmetic_script_for_domain("example.com"), "");

        assert_eq!(manager.enable().await, FilterState::Active);
        assert!(manager
            .cosmetic_script_for_domain("example.com")
            .contains("__sift_cosmetic_init"));
        assert_eq!(fetcher.total_downloads(), 1);
    }

    #[tokio::test]
    async fn disabled_config_starts_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let config = FilterConfig {
            enabled: false,
            ..test_config(dir.path(), &[LIST_A])
        };
        let manager = manager_with(config, &fetcher);

        assert_eq!(manager.initialize().await, FilterState::Disabled);
        assert_eq!(fetcher.total_downloads(), 0);
    }

    #[tokio::test]
    async fn whitelist_changes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        assert!(manager.add_to_whitelist("Shop.Example.com").await.unwrap());
        assert!(!manager.add_to_whitelist("shop.example.com").await.unwrap());
        assert_eq!(manager.whitelist().await, vec!["shop.example.com"]);
        assert!(has_pattern(&live_patterns(&manager).await, "shop\\.example\\.com"));

        assert!(manager.remove_from_whitelist("shop.example.com").await.unwrap());
        assert!(!manager.remove_from_whitelist("shop.example.com").await.unwrap());
        assert!(!has_pattern(&live_patterns(&manager).await, "shop\\.example\\.com"));

        assert!(matches!(
            manager.add_to_whitelist("not a domain").await,
            Err(FilterError::Config(_))
        ));
    }

    #[tokio::test]
    async fn whitelist_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let config = FilterConfig {
            whitelist: vec!["example.com".to_string()],
            ..test_config(dir.path(), &[LIST_A])
        };
        let manager = manager_with(config, &fetcher);
        manager.initialize().await;

        let cached = FileFilterStore::new(dir.path()).load_cached().unwrap();
        assert!(cached.network_rules.iter().all(|r| !r.is_allow() || r.url_pattern.contains("tracker")));
        assert!(!cached.network_rules.iter().any(|r| r.url_pattern == "^dumb://"));
        assert!(cached.generic_hiding.iter().all(|s| s != ".ad-loading"));
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        manager.clear().await.unwrap();
        assert_eq!(manager.status().state, FilterState::Uninitialized);
        assert!(matches!(manager.network_payload().await, Err(FilterError::NotReady)));
        assert!(manager.cosmetic_rules_for_domain("example.com").is_empty());
        assert!(!FileFilterStore::new(dir.path()).cache_info().exists);
    }

    #[tokio::test]
    async fn publishes_to_engine() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        let engine = FileExportEngine::new(out.path());

        assert!(matches!(manager.publish_to(&engine).await, Err(FilterError::NotReady)));

        manager.initialize().await;
        let count = manager.publish_to(&engine).await.unwrap();
        assert!(engine.is_compiled());
        assert_eq!(count, live_patterns(&manager).await.len());
        assert!(engine.payload_path(FILTER_IDENTIFIER).exists());
    }

    #[tokio::test]
    async fn runtime_cosmetic_updates() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, EASY_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        let selectors = vec![".late-ad".to_string()];
        manager.update_cosmetic_rules("news.site", &selectors);
        assert!(manager
            .cosmetic_rules_for_domain("news.site")
            .contains(&".late-ad".to_string()));
        assert!(manager
            .cosmetic_update_script(&selectors)
            .contains("__sift_cosmetic_update"));
        assert!(manager.cosmetic_cleanup_script().contains("__sift_cosmetic_cleanup"));
    }

    #[tokio::test]
    async fn update_loop_respects_auto_update_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        assert!(manager.start_update_loop().is_none());

        let config = FilterConfig {
            auto_update: true,
            startup_delay_secs: 3600,
            ..test_config(dir.path(), &[LIST_A])
        };
        let manager = manager_with(config, &fetcher);
        let handle = manager.start_update_loop().unwrap();
        manager.shutdown();
        handle.await.unwrap();
        assert_eq!(fetcher.probes(LIST_A), 0);
    }

    #[test]
    fn duplicate_sources_are_collapsed() {
        let config = FilterConfig {
            filter_lists: vec![LIST_A.to_string(), LIST_B.to_string(), LIST_A.to_string()],
            ..FilterConfig::default()
        };
        assert_eq!(unique_sources(&config), vec![LIST_A, LIST_B]);
    }
}
