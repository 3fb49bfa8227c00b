//! Element-hiding script generation.
//!
//! The injector holds its own copy of the cosmetic rules so script requests
//! from page loads never wait on the manager's lock.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use sift_core::domain::ancestors;
use sift_core::CosmeticRuleSet;

const BOOTSTRAP: &str = include_str!("injector.js");

const CLEANUP_SCRIPT: &str = r#"
(function() {
    if (typeof window.__sift_cosmetic_cleanup === 'function') {
        window.__sift_cosmetic_cleanup();
    }
})();"#;

#[derive(Serialize)]
struct ScriptRule<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    selector: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InjectorStats {
    pub enabled: bool,
    pub generic_rules: usize,
    pub domain_count: usize,
    pub total_rules: usize,
}

struct InjectorState {
    domain_rules: CosmeticRuleSet,
    generic_rules: Vec<String>,
    enabled: bool,
}

pub struct CosmeticInjector {
    state: RwLock<InjectorState>,
}

impl Default for CosmeticInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl CosmeticInjector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(InjectorState {
                domain_rules: CosmeticRuleSet::new(),
                generic_rules: Vec::new(),
                enabled: true,
            }),
        }
    }

    /// Replace the whole table. The empty-string key holds generic selectors.
    pub fn inject_rules(&self, rules: BTreeMap<String, Vec<String>>) {
        let mut state = self.write();
        state.domain_rules = CosmeticRuleSet::new();
        state.generic_rules.clear();

        for (domain, selectors) in rules {
            if domain.is_empty() {
                state.generic_rules.extend(selectors);
            } else {
                state.domain_rules.extend_domain(&domain, selectors);
            }
        }

        log::debug!(
            "Injected cosmetic rules for {} domains plus {} generic",
            state.domain_rules.domain_count(),
            state.generic_rules.len()
        );
    }

    /// Bootstrap plus an init call carrying every selector for `domain`.
    /// Empty when cosmetic filtering is disabled.
    pub fn script_for_domain(&self, domain: &str) -> String {
        let state = self.read();
        if !state.enabled {
            return String::new();
        }

        let mut rules: Vec<ScriptRule<'_>> = state
            .generic_rules
            .iter()
            .map(|selector| ScriptRule {
                domain: None,
                selector,
            })
            .collect();
        for key in std::iter::once(domain).chain(ancestors(domain)) {
            if key.is_empty() {
                continue;
            }
            rules.extend(state.domain_rules.get(key).iter().map(|selector| ScriptRule {
                domain: Some(key),
                selector,
            }));
        }

        let rules_json = match serde_json::to_string(&rules) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode cosmetic rules: {}", e);
                return BOOTSTRAP.to_string();
            }
        };

        format!(
            "{BOOTSTRAP}\n(function() {{\n    if (typeof window.__sift_cosmetic_init === 'function') {{\n        window.__sift_cosmetic_init({rules_json});\n    }}\n}})();"
        )
    }

    /// Add selectors for `domain` (empty for generic). No-op when disabled.
    pub fn update_rules_for_domain(&self, domain: &str, selectors: &[String]) {
        let mut state = self.write();
        if !state.enabled || selectors.is_empty() {
            return;
        }
        if domain.is_empty() {
            state.generic_rules.extend_from_slice(selectors);
        } else {
            state.domain_rules.extend_domain(domain, selectors.iter().cloned());
        }
        log::debug!("Added {} cosmetic rules for '{}'", selectors.len(), domain);
    }

    /// Script pushing `selectors` into an already initialized page.
    pub fn update_script(&self, selectors: &[String]) -> String {
        if !self.is_enabled() || selectors.is_empty() {
            return String::new();
        }
        let selectors_json = match serde_json::to_string(selectors) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode cosmetic update: {}", e);
                return String::new();
            }
        };
        format!(
            "\n(function() {{\n    if (typeof window.__sift_cosmetic_update === 'function') {{\n        window.__sift_cosmetic_update({selectors_json});\n    }}\n}})();"
        )
    }

    pub fn cleanup_script(&self) -> &'static str {
        CLEANUP_SCRIPT
    }

    /// Generic selectors, then the domain's, then its ancestors'.
    pub fn rules_for_domain(&self, domain: &str) -> Vec<String> {
        let state = self.read();
        let mut rules = state.generic_rules.clone();
        rules.extend(state.domain_rules.lookup(domain));
        rules
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.write().enabled = enabled;
        log::info!(
            "Cosmetic filtering {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.read().enabled
    }

    pub fn stats(&self) -> InjectorStats {
        let state = self.read();
        InjectorStats {
            enabled: state.enabled,
            generic_rules: state.generic_rules.len(),
            domain_count: state.domain_rules.domain_count(),
            total_rules: state.generic_rules.len() + state.domain_rules.selector_count(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, InjectorState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, InjectorState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
