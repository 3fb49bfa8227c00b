//! Compiled filter set
//!
//! The aggregate produced by the converter, merged across sources, persisted
//! by the store and handed to the content-blocking engine.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content_blocker::ContentBlockerRule;
use crate::domain::ancestors;
use crate::types::NetworkRule;

/// Error type for encoding and decoding filter sets.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Failed to serialize filter set: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to deserialize filter set: {0}")]
    Deserialize(#[source] serde_json::Error),
}

// =============================================================================
// Cosmetic Rules
// =============================================================================

/// Domain -> ordered selectors. Lookups include every ancestor domain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CosmeticRuleSet {
    rules: BTreeMap<String, Vec<String>>,
}

impl CosmeticRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: &str, selector: &str) {
        self.rules
            .entry(domain.to_string())
            .or_default()
            .push(selector.to_string());
    }

    pub fn extend_domain<I>(&mut self, domain: &str, selectors: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.rules.entry(domain.to_string()).or_default().extend(selectors);
    }

    /// Selectors registered directly under `domain`.
    pub fn get(&self, domain: &str) -> &[String] {
        self.rules.get(domain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Selectors for `domain` followed by those of each ancestor.
    pub fn lookup(&self, domain: &str) -> Vec<String> {
        let mut selectors = self.get(domain).to_vec();
        for parent in ancestors(domain) {
            selectors.extend_from_slice(self.get(parent));
        }
        selectors
    }

    /// Remove one occurrence of each of `selectors` under `domain`.
    pub fn remove_selectors(&mut self, domain: &str, selectors: &[String]) -> usize {
        let Some(bucket) = self.rules.get_mut(domain) else {
            return 0;
        };
        let removed = remove_occurrences(bucket, selectors);
        if bucket.is_empty() {
            self.rules.remove(domain);
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.rules.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Vec<String>)> {
        self.rules.iter_mut()
    }

    pub fn domain_count(&self) -> usize {
        self.rules.len()
    }

    pub fn selector_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Clone into a plain map, e.g. for the cosmetic injector.
    pub fn to_map(&self) -> BTreeMap<String, Vec<String>> {
        self.rules.clone()
    }
}

// =============================================================================
// Compiled Filter Set
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompiledFilterSet {
    pub network_rules: Vec<NetworkRule>,
    pub cosmetic_rules: CosmeticRuleSet,
    pub generic_hiding: Vec<String>,
    pub compiled_at: DateTime<Utc>,
    pub version: String,
}

impl CompiledFilterSet {
    /// Empty set stamped with the current time.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            compiled_at: Utc::now(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Append every rule of `other`. Merging never deletes anything.
    pub fn merge(&mut self, other: CompiledFilterSet) {
        self.network_rules.extend(other.network_rules);
        for (domain, selectors) in other.cosmetic_rules.rules {
            self.cosmetic_rules.extend_domain(&domain, selectors);
        }
        self.generic_hiding.extend(other.generic_hiding);
    }

    /// Multiset difference: for each rule in `other`, remove one equal rule.
    /// Returns the number of rules removed.
    ///
    /// When a rule occurs more than once the latest occurrences go first.
    /// The surviving rules keep their relative order.
    pub fn subtract(&mut self, other: &CompiledFilterSet) -> usize {
        let mut removed = remove_occurrences(&mut self.network_rules, &other.network_rules);
        for (domain, selectors) in other.cosmetic_rules.iter() {
            removed += self.cosmetic_rules.remove_selectors(domain, selectors);
        }
        removed += remove_occurrences(&mut self.generic_hiding, &other.generic_hiding);
        removed
    }

    /// Generic hiding selectors, then `domain`'s own, then each ancestor's.
    pub fn rules_for_domain(&self, domain: &str) -> Vec<String> {
        let mut rules = self.generic_hiding.clone();
        rules.extend(self.cosmetic_rules.lookup(domain));
        rules
    }

    pub fn serialize(&self) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec(self).map_err(FormatError::Serialize)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(bytes).map_err(FormatError::Deserialize)
    }

    /// JSON array of `{trigger, action}` objects for the content-blocking engine.
    pub fn to_content_blocker_json(&self) -> Result<Vec<u8>, FormatError> {
        let rules: Vec<ContentBlockerRule> =
            self.network_rules.iter().map(ContentBlockerRule::from).collect();
        serde_json::to_vec(&rules).map_err(FormatError::Serialize)
    }

    pub fn network_len(&self) -> usize {
        self.network_rules.len()
    }

    pub fn rule_count(&self) -> usize {
        self.network_rules.len() + self.cosmetic_rules.selector_count() + self.generic_hiding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.network_rules.is_empty()
            && self.cosmetic_rules.is_empty()
            && self.generic_hiding.is_empty()
    }
}

/// Remove one element equal to each entry of `remove`, scanning from the
/// back, in a single pass over `items`.
fn remove_occurrences<T: Eq + Hash>(items: &mut Vec<T>, remove: &[T]) -> usize {
    if remove.is_empty() || items.is_empty() {
        return 0;
    }
    let mut pending: HashMap<&T, usize> = HashMap::with_capacity(remove.len());
    for item in remove {
        *pending.entry(item).or_default() += 1;
    }

    let mut keep = vec![true; items.len()];
    let mut removed = 0;
    for (index, item) in items.iter().enumerate().rev() {
        if let Some(count) = pending.get_mut(item) {
            if *count > 0 {
                *count -= 1;
                keep[index] = false;
                removed += 1;
            }
        }
    }

    let mut index = 0;
    items.retain(|_| {
        let kept = keep[index];
        index += 1;
        kept
    });
    removed
}
