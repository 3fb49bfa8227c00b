//! Sift Core Library
//!
//! Rule model shared by every Sift crate: network and cosmetic rules, the
//! compiled filter set aggregate, and the payload handed to the external
//! content-blocking engine.
//!
//! # Modules
//!
//! - `types`: Network rule and its option types
//! - `filter_set`: Compiled filter set and per-domain cosmetic rules
//! - `content_blocker`: Content-blocker JSON payload (`{trigger, action}`)
//! - `domain`: Domain normalization, ancestor walk and regex escaping
//! - `hash`: Content hashes and fingerprints

pub mod content_blocker;
pub mod domain;
pub mod filter_set;
pub mod hash;
pub mod types;

// Re-export commonly used types
pub use filter_set::{CompiledFilterSet, CosmeticRuleSet, FormatError};
pub use hash::{content_hash, fingerprint, list_id};
pub use types::{DomainScope, NetworkRule, PartyScope, ResourceType, RuleAction};
