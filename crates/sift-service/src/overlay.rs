//! Rules layered over subscription content before it goes live.
//!
//! Order in the effective set: subscription rules, whitelist allow-overrides,
//! the fixed block rules, then the internal-scheme allow-override last so
//! nothing can block internal pages.

use sift_compiler::parser::{HOST_ANCHOR_PREFIX, SEPARATOR_CLASS};
use sift_core::domain::escape_regex;
use sift_core::{fingerprint, CompiledFilterSet, NetworkRule, ResourceType};

/// Scripts that hang page loads when left half-blocked by list rules.
const FIXED_BLOCKS: &[(&str, Option<ResourceType>)] = &[
    ("googlesyndication.com", Some(ResourceType::SCRIPT)),
    ("doubleclick.net", None),
    ("googletagservices.com/tag/js/gpt.js", Some(ResourceType::SCRIPT)),
];

/// Hides placeholders left behind by blocked ad loaders.
pub const ANTI_LOADER_SELECTORS: &[&str] = &[
    ".ad-loading",
    ".ad-placeholder",
    ".loading-ad",
    ".ad-spinner",
    "[class*='loading'][class*='ad']",
    "[id*='loading'][id*='ad']",
    ".spinner[class*='ad']",
    "[data-loading*='ad']",
    ".infinite-loader",
    ".loading-infinite",
    "[data-loading='infinite']",
    ".loader[style*='infinite']",
    ".spinner[data-infinite='true']",
    ".advertisement-loading",
    ".ads-loading",
    ".publicity-loading",
];

/// Allow-override for every URL on `domain` or its subdomains.
pub fn whitelist_rule(domain: &str) -> NetworkRule {
    NetworkRule::allow(format!(
        "{HOST_ANCHOR_PREFIX}{}{SEPARATOR_CLASS}",
        escape_regex(domain)
    ))
}

pub fn fixed_rules(internal_scheme: &str) -> Vec<NetworkRule> {
    let mut rules: Vec<NetworkRule> = FIXED_BLOCKS
        .iter()
        .map(|(pattern, types)| {
            let rule = NetworkRule::block(escape_regex(pattern));
            match types {
                Some(types) => rule.with_resource_types(*types),
                None => rule,
            }
        })
        .collect();
    rules.push(NetworkRule::allow(format!("^{}://", escape_regex(internal_scheme))));
    rules
}

/// Whitelist rules, rebuilt only when the domain list changes.
#[derive(Debug, Default)]
pub struct WhitelistCache {
    key: Option<u64>,
    rules: Vec<NetworkRule>,
    rebuilds: usize,
}

impl WhitelistCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules_for(&mut self, domains: &[String]) -> &[NetworkRule] {
        let key = fingerprint(domains);
        if self.key != Some(key) {
            self.rules = domains.iter().map(|d| whitelist_rule(d)).collect();
            self.key = Some(key);
            self.rebuilds += 1;
            log::debug!("Rebuilt {} whitelist rules", self.rules.len());
        }
        &self.rules
    }

    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }
}

/// Subscription content plus whitelist, fixed rules and anti-loader selectors.
pub fn build_effective(
    base: &CompiledFilterSet,
    whitelist: &[NetworkRule],
    internal_scheme: &str,
) -> CompiledFilterSet {
    let mut effective = base.clone();
    effective.network_rules.extend_from_slice(whitelist);
    effective.network_rules.extend(fixed_rules(internal_scheme));
    effective
        .generic_hiding
        .extend(ANTI_LOADER_SELECTORS.iter().map(|s| s.to_string()));
    effective
}
