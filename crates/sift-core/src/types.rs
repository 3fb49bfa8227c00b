//! Core type definitions for Sift
//!
//! A `NetworkRule` is the unit handed to the content-blocking engine. It is
//! built once by the converter and never mutated afterwards.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// =============================================================================
// Rule Actions
// =============================================================================

/// Action to take for a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    /// Block rule - cancels the request
    #[default]
    Block,
    /// Exception rule (@@...) - overrides every block rule appended before it
    AllowOverride,
}

// =============================================================================
// Resource Types
// =============================================================================

bitflags::bitflags! {
    /// Resource types a rule is restricted to. Empty means "any type".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ResourceType: u16 {
        const SCRIPT = 1 << 0;
        const IMAGE = 1 << 1;
        const STYLESHEET = 1 << 2;
        const FONT = 1 << 3;
        const MEDIA = 1 << 4;
        const DOCUMENT = 1 << 5;
        const POPUP = 1 << 6;
    }
}

impl ResourceType {
    /// Parse a filter option name (`script`, `image`, ...).
    pub fn from_option(name: &str) -> Option<Self> {
        match name {
            "script" => Some(Self::SCRIPT),
            "image" => Some(Self::IMAGE),
            "stylesheet" => Some(Self::STYLESHEET),
            "font" => Some(Self::FONT),
            "media" => Some(Self::MEDIA),
            "document" => Some(Self::DOCUMENT),
            "popup" => Some(Self::POPUP),
            _ => None,
        }
    }

    /// Names used by the content-blocker `resource-type` trigger field.
    pub fn content_blocker_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for (flag, name) in [
            (Self::SCRIPT, "script"),
            (Self::IMAGE, "image"),
            (Self::STYLESHEET, "style-sheet"),
            (Self::FONT, "font"),
            (Self::MEDIA, "media"),
            (Self::DOCUMENT, "document"),
            (Self::POPUP, "popup"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        names
    }
}

// =============================================================================
// Party Scope
// =============================================================================

/// Whether a rule applies to first-party requests, third-party requests or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartyScope {
    #[default]
    Any,
    FirstParty,
    ThirdParty,
}

// =============================================================================
// Domain Scope
// =============================================================================

/// `$domain=` constraint. Empty include set means "every domain".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DomainScope {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub include: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude: BTreeSet<String>,
}

impl DomainScope {
    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

// =============================================================================
// Network Rule
// =============================================================================

/// A block/allow directive matched against request URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRule {
    /// Regex source matched against the full request URL
    pub url_pattern: String,
    #[serde(default, skip_serializing_if = "ResourceType::is_empty")]
    pub resource_types: ResourceType,
    #[serde(default)]
    pub party_scope: PartyScope,
    #[serde(default, skip_serializing_if = "DomainScope::is_unrestricted")]
    pub domain_scope: DomainScope,
    pub action: RuleAction,
}

impl NetworkRule {
    /// Unscoped block rule.
    pub fn block(url_pattern: impl Into<String>) -> Self {
        Self::new(url_pattern, RuleAction::Block)
    }

    /// Unscoped allow-override rule.
    pub fn allow(url_pattern: impl Into<String>) -> Self {
        Self::new(url_pattern, RuleAction::AllowOverride)
    }

    pub fn new(url_pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            resource_types: ResourceType::empty(),
            party_scope: PartyScope::Any,
            domain_scope: DomainScope::default(),
            action,
        }
    }

    pub fn with_resource_types(mut self, types: ResourceType) -> Self {
        self.resource_types = types;
        self
    }

    pub fn with_party_scope(mut self, scope: PartyScope) -> Self {
        self.party_scope = scope;
        self
    }

    pub fn is_allow(&self) -> bool {
        self.action == RuleAction::AllowOverride
    }
}
