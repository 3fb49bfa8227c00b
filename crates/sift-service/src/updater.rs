//! Differential subscription updates
//!
//! Each cycle probes every subscription for a version token and only
//! downloads the lists whose token changed. A changed list is diffed
//! line-by-line against its last snapshot and the compiled delta is applied
//! to the live filters, so an update costs time proportional to what
//! changed rather than to the size of the lists.

use std::sync::Arc;

use chrono::Utc;
use sift_compiler::{compile_delta, compile_snapshot, diff_lines, extract_version, FilterDelta};
use sift_core::{content_hash, list_id, CompiledFilterSet};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::FilterError;
use crate::fetch::{FetchError, SourceFetcher};
use crate::manager::{unique_sources, FilterManager};
use crate::store::FilterStore;

/// A subscription whose content changed since the last cycle.
#[derive(Debug, Clone)]
pub struct FilterUpdate {
    pub url: String,
    pub list_id: String,
    pub previous: Option<Vec<u8>>,
    pub current: Vec<u8>,
    pub content_hash: String,
    pub version: Option<String>,
    pub delta: FilterDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Skipped because the last check is more recent than the update interval
    pub throttled: bool,
    /// Skipped because content filtering is disabled
    pub disabled: bool,
    pub checked: usize,
    pub unchanged: usize,
    pub applied: usize,
    pub failed: usize,
    /// Fell back to recompiling every list
    pub full_refresh: bool,
}

enum SourceCheck {
    /// Nothing to apply. Carries a token to record when the body was fetched.
    Unchanged { version: Option<String> },
    Changed(FilterUpdate),
}

pub struct FilterUpdater {
    manager: Arc<FilterManager>,
}

impl FilterUpdater {
    pub fn new(manager: Arc<FilterManager>) -> Self {
        Self { manager }
    }

    /// Run one update cycle. `force` ignores the update interval.
    pub async fn check_and_update(&self, force: bool) -> UpdateReport {
        let mut report = UpdateReport::default();
        let manager = &self.manager;
        let store = Arc::clone(manager.store());

        if !manager.is_enabled().await {
            log::debug!("Content filtering disabled, skipping update check");
            report.disabled = true;
            return report;
        }

        if !force && self.checked_recently() {
            log::debug!("Skipping filter update check, last check is recent");
            report.throttled = true;
            return report;
        }

        let guard = manager.lock_updates().await;
        let sources = unique_sources(manager.config());

        if sources.is_empty() {
            log::warn!("No filter lists configured, nothing to update");
            return report;
        }

        // A delta only makes sense against the set it was diffed from.
        if !manager.has_base().await {
            log::info!("No filters loaded, recompiling every list");
            report.full_refresh = true;
            report.checked = sources.len();
            match manager.refresh_locked(&guard).await {
                Ok(_) => report.applied = sources.len(),
                Err(e) => {
                    log::warn!("Full recompile failed: {}", e);
                    report.failed = sources.len();
                }
            }
            return report;
        }

        // Rules of a list that was dropped from the configuration can only
        // be removed by recompiling everything.
        let dropped: Vec<String> = store
            .source_urls()
            .into_iter()
            .filter(|url| !sources.contains(url))
            .collect();
        if !dropped.is_empty() {
            log::info!("Lists removed from configuration: {:?}", dropped);
        }
        let mut needs_full_refresh = !dropped.is_empty();

        let semaphore = Arc::new(Semaphore::new(manager.config().max_concurrent_downloads));
        let (tx, mut rx) = mpsc::channel(sources.len());
        for url in sources {
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(manager.fetcher());
            let store = Arc::clone(&store);
            let cancel = manager.cancellation_token();
            tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        check_source(fetcher.as_ref(), store.as_ref(), &url, &cancel).await
                    }
                    Err(_) => Err(FilterError::Cancelled),
                };
                let _ = tx.send((url, result)).await;
            });
        }
        drop(tx);

        while let Some((url, result)) = rx.recv().await {
            report.checked += 1;
            match result {
                Ok(SourceCheck::Unchanged { version }) => {
                    report.unchanged += 1;
                    if let Some(version) = version {
                        if let Err(e) = store.set_source_version(&url, &version) {
                            log::warn!("Failed to record version of {}: {}", url, e);
                        }
                    }
                }
                Ok(SourceCheck::Changed(update)) => {
                    if update.previous.is_none() {
                        log::info!("No snapshot for {}, scheduling full recompile", url);
                        needs_full_refresh = true;
                        continue;
                    }
                    match self.apply_update(update).await {
                        Ok(()) => report.applied += 1,
                        Err(e) => {
                            log::warn!("Failed to apply update for {}: {}", url, e);
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Update check failed for {}: {}", url, e);
                    report.failed += 1;
                }
            }
        }

        if manager.cancellation_token().is_cancelled() {
            return report;
        }

        if needs_full_refresh {
            report.full_refresh = true;
            if let Err(e) = manager.refresh_locked(&guard).await {
                log::warn!("Full recompile failed: {}", e);
            }
        } else if report.applied > 0 {
            manager.publish_active("Filters updated").await;
        }

        if report.checked > report.failed {
            if let Err(e) = store.touch_last_check() {
                log::warn!("Failed to record check time: {}", e);
            }
        }

        log::info!(
            "Filter update: {} checked, {} unchanged, {} applied, {} failed",
            report.checked,
            report.unchanged,
            report.applied,
            report.failed
        );
        report
    }

    fn checked_recently(&self) -> bool {
        let Some(last) = self.manager.store().last_check_time() else {
            return false;
        };
        match chrono::Duration::from_std(self.manager.config().update_interval()) {
            Ok(interval) => Utc::now() - last < interval,
            Err(_) => false,
        }
    }

    async fn apply_update(&self, update: FilterUpdate) -> Result<(), FilterError> {
        let manager = &self.manager;
        let store = manager.store();
        let FilterUpdate {
            url,
            list_id,
            current,
            version,
            delta,
            ..
        } = update;

        log::info!(
            "Updating {}: +{} / -{} rules",
            url,
            delta.added.rule_count(),
            delta.removed.rule_count()
        );

        let base = manager.apply_delta(delta).await?;
        if !manager.persist(base).await {
            // The cache no longer matches the snapshots; force a recompile
            // on next start instead of diffing against it.
            store.invalidate()?;
            return Ok(());
        }

        store.save_snapshot(&list_id, &current)?;
        if let Some(version) = version {
            store.set_source_version(&url, &version)?;
        }
        Ok(())
    }
}

async fn check_source(
    fetcher: &dyn SourceFetcher,
    store: &dyn FilterStore,
    url: &str,
    cancel: &CancellationToken,
) -> Result<SourceCheck, FilterError> {
    let stored = store.source_version(url);
    let probed = match fetcher.probe_version(url, cancel).await {
        Ok(token) => Some(token),
        Err(FetchError::Cancelled) => return Err(FilterError::Cancelled),
        Err(e) => {
            log::debug!("Version probe failed for {}: {}", url, e);
            None
        }
    };

    if let (Some(probed), Some(stored)) = (&probed, &stored) {
        if probed == stored {
            log::debug!("{} unchanged (version {})", url, stored);
            return Ok(SourceCheck::Unchanged { version: None });
        }
    }

    let current = fetcher
        .download(url, cancel)
        .await
        .map_err(|e| FilterError::network(url, e))?;
    let hash = content_hash(&current);
    let version = extract_version(&current).or(probed);
    let id = list_id(url);
    let previous = store.load_snapshot(&id)?;

    if let Some(previous) = &previous {
        if content_hash(previous) == hash {
            log::debug!("{} content unchanged", url);
            return Ok(SourceCheck::Unchanged { version });
        }
    }

    let (delta, previous, current) = tokio::task::spawn_blocking(move || {
        let delta = compute_delta(previous.as_deref(), &current);
        (delta, previous, current)
    })
    .await
    .map_err(|e| FilterError::InvalidFormat(format!("diff task failed: {e}")))?;

    if previous.is_some() && delta.added.is_empty() && delta.removed.is_empty() {
        return Ok(SourceCheck::Unchanged { version });
    }

    Ok(SourceCheck::Changed(FilterUpdate {
        url: url.to_string(),
        list_id: id,
        previous,
        current,
        content_hash: hash,
        version,
        delta,
    }))
}

/// Delta from `previous` to `current`. Without a previous snapshot the whole
/// list is an addition.
fn compute_delta(previous: Option<&[u8]>, current: &[u8]) -> FilterDelta {
    let current = String::from_utf8_lossy(current);
    match previous {
        Some(previous) => {
            let diff = diff_lines(&String::from_utf8_lossy(previous), &current);
            compile_delta(&diff)
        }
        None => FilterDelta {
            added: compile_snapshot(&current).0,
            removed: CompiledFilterSet::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FilterState;
    use crate::store::FileFilterStore;
    use crate::testing::{live_patterns, manager_with, test_config, MockFetcher, LIST_A, LIST_B};

    const V1: &str = "! Version: 1\n||old.example^\n||keep.example^\nsite.com##.old\n";
    const V2: &str = "! Version: 2\n||keep.example^\n||new.example^\nsite.com##.new\n";
    const OTHER: &str = "! Version: 9\n||other.example^\n";

    fn has(patterns: &[String], needle: &str) -> bool {
        patterns.iter().any(|p| p.contains(needle))
    }

    #[tokio::test]
    async fn unchanged_versions_download_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        fetcher.serve(LIST_B, OTHER);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);
        manager.initialize().await;
        let downloads = fetcher.total_downloads();

        let report = manager.updater().check_and_update(true).await;

        assert_eq!(report.checked, 2);
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.applied, 0);
        assert_eq!(fetcher.total_downloads(), downloads);
        assert_eq!(fetcher.probes(LIST_A), 1);
    }

    #[tokio::test]
    async fn changed_list_applies_diff() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        fetcher.serve(LIST_B, OTHER);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);
        manager.initialize().await;

        fetcher.serve(LIST_A, V2);
        let report = manager.updater().check_and_update(true).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.unchanged, 1);
        assert!(!report.full_refresh);
        assert_eq!(fetcher.downloads(LIST_B), 1);

        let patterns = live_patterns(&manager).await;
        assert!(!has(&patterns, "old\\.example"));
        assert!(has(&patterns, "keep\\.example"));
        assert!(has(&patterns, "new\\.example"));
        assert!(has(&patterns, "other\\.example"));
        assert!(!manager.cosmetic_rules_for_domain("site.com").contains(&".old".to_string()));
        assert!(manager.cosmetic_rules_for_domain("site.com").contains(&".new".to_string()));
        assert_eq!(manager.status().state, FilterState::Active);

        // The persisted cache matches a fresh compile of both lists
        let store = FileFilterStore::new(dir.path());
        assert_eq!(store.source_version(LIST_A).as_deref(), Some("2"));
        assert_eq!(store.load_snapshot(&list_id(LIST_A)).unwrap().unwrap(), V2.as_bytes());

        let mut cached: Vec<_> = store
            .load_cached()
            .unwrap()
            .network_rules
            .into_iter()
            .map(|r| r.url_pattern)
            .collect();
        let mut fresh = compile_snapshot(V2).0;
        fresh.merge(compile_snapshot(OTHER).0);
        let mut expected: Vec<_> = fresh.network_rules.into_iter().map(|r| r.url_pattern).collect();
        cached.sort();
        expected.sort();
        assert_eq!(cached, expected);
    }

    #[tokio::test]
    async fn recent_check_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        let report = manager.updater().check_and_update(false).await;
        assert!(report.throttled);
        assert_eq!(fetcher.probes(LIST_A), 0);
    }

    #[tokio::test]
    async fn unversioned_list_with_same_content_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, "||a.example^\n");
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        let report = manager.updater().check_and_update(true).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(fetcher.downloads(LIST_A), 2);
    }

    #[tokio::test]
    async fn failing_source_keeps_filters_active() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        fetcher.serve(LIST_B, OTHER);
        let manager = manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher);
        manager.initialize().await;

        fetcher.serve(LIST_A, V2);
        fetcher.fail(LIST_B);
        let report = manager.updater().check_and_update(true).await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(manager.status().state, FilterState::Active);
        assert!(has(&live_patterns(&manager).await, "other\\.example"));
    }

    #[tokio::test]
    async fn missing_snapshot_triggers_full_recompile() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        std::fs::remove_dir_all(dir.path().join("snapshots")).unwrap();
        fetcher.serve(LIST_A, V2);
        let report = manager.updater().check_and_update(true).await;

        assert!(report.full_refresh);
        let patterns = live_patterns(&manager).await;
        assert!(!has(&patterns, "old\\.example"));
        assert_eq!(
            patterns.iter().filter(|p| p.contains("keep\\.example")).count(),
            1
        );
    }

    #[tokio::test]
    async fn dropped_list_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        fetcher.serve(LIST_B, OTHER);
        manager_with(test_config(dir.path(), &[LIST_A, LIST_B]), &fetcher)
            .initialize()
            .await;

        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;
        assert!(has(&live_patterns(&manager).await, "other\\.example"));

        let report = manager.updater().check_and_update(true).await;
        assert!(report.full_refresh);
        assert!(!has(&live_patterns(&manager).await, "other\\.example"));
        assert_eq!(FileFilterStore::new(dir.path()).source_urls(), vec![LIST_A]);
    }

    #[tokio::test]
    async fn update_without_loaded_filters_recompiles_whole_list() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        manager_with(test_config(dir.path(), &[LIST_A]), &fetcher)
            .initialize()
            .await;

        // Unusable cache and an unreachable source leave no filters loaded,
        // while the V1 snapshot stays on disk.
        let path = dir.path().join("filters.json");
        let mut data = std::fs::read(&path).unwrap();
        data[0] ^= 0xff;
        std::fs::write(&path, data).unwrap();
        fetcher.fail(LIST_A);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        assert_eq!(manager.initialize().await, FilterState::Error);
        assert!(FileFilterStore::new(dir.path())
            .load_snapshot(&list_id(LIST_A))
            .unwrap()
            .is_some());

        fetcher.serve(LIST_A, V2);
        let report = manager.updater().check_and_update(true).await;

        assert!(report.full_refresh);
        assert_eq!(manager.status().state, FilterState::Active);
        let patterns = live_patterns(&manager).await;
        assert!(has(&patterns, "keep\\.example"));
        assert!(has(&patterns, "new\\.example"));
        assert!(!has(&patterns, "old\\.example"));

        let cached: Vec<_> = FileFilterStore::new(dir.path())
            .load_cached()
            .unwrap()
            .network_rules
            .into_iter()
            .map(|r| r.url_pattern)
            .collect();
        let expected: Vec<_> = compile_snapshot(V2)
            .0
            .network_rules
            .into_iter()
            .map(|r| r.url_pattern)
            .collect();
        assert_eq!(cached, expected);
    }

    #[tokio::test]
    async fn apply_delta_needs_loaded_filters() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);

        let delta = compute_delta(Some(V1.as_bytes()), V2.as_bytes());
        assert!(matches!(manager.apply_delta(delta).await, Err(FilterError::NotReady)));
        assert!(!manager.has_filters().await);
    }

    #[tokio::test]
    async fn disabled_manager_does_not_update() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V1);
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;
        let cache_before = std::fs::read(dir.path().join("filters.json")).unwrap();

        manager.disable().await;
        fetcher.serve(LIST_A, V2);
        let report = manager.updater().check_and_update(true).await;

        assert!(report.disabled);
        assert_eq!(report.checked, 0);
        assert_eq!(fetcher.probes(LIST_A), 0);
        assert_eq!(fetcher.downloads(LIST_A), 1);
        assert_eq!(std::fs::read(dir.path().join("filters.json")).unwrap(), cache_before);
        assert_eq!(manager.status().state, FilterState::Disabled);
    }

    #[tokio::test]
    async fn disabled_at_start_does_not_update() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve(LIST_A, V2);
        let config = crate::config::FilterConfig {
            enabled: false,
            ..test_config(dir.path(), &[LIST_A])
        };
        let manager = manager_with(config, &fetcher);
        assert_eq!(manager.initialize().await, FilterState::Disabled);

        let report = manager.updater().check_and_update(true).await;

        assert!(report.disabled);
        assert_eq!(fetcher.probes(LIST_A), 0);
        assert_eq!(fetcher.total_downloads(), 0);
        assert!(!dir.path().join("filters.json").exists());
    }

    #[tokio::test]
    async fn unversioned_list_records_server_token_on_first_compile() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.serve_with_token(LIST_A, "||a.example^\n", "\"etag-1\"");
        let manager = manager_with(test_config(dir.path(), &[LIST_A]), &fetcher);
        manager.initialize().await;

        assert_eq!(
            FileFilterStore::new(dir.path()).source_version(LIST_A).as_deref(),
            Some("\"etag-1\"")
        );

        let report = manager.updater().check_and_update(true).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(fetcher.downloads(LIST_A), 1);
    }

    #[test]
    fn delta_without_snapshot_adds_everything() {
        let delta = compute_delta(None, b"||a.com^\n##.ad\n");
        assert_eq!(delta.added.network_rules.len(), 1);
        assert_eq!(delta.added.generic_hiding, vec![".ad"]);
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn delta_with_snapshot_is_minimal() {
        let delta = compute_delta(
            Some(b"! Version: 1\n||a.com^\n||b.com^\n"),
            b"! Version: 2\n||b.com^\n||c.com^\n",
        );
        assert_eq!(delta.added.network_rules.len(), 1);
        assert_eq!(delta.removed.network_rules.len(), 1);
        assert!(delta.added.network_rules[0].url_pattern.contains("c\\.com"));
        assert!(delta.removed.network_rules[0].url_pattern.contains("a\\.com"));
    }
}
