//! Content-blocker payload
//!
//! The consuming engine takes a JSON array of `{trigger, action}` objects:
//!
//! ```json
//! [{"trigger": {"url-filter": "^https?://([^/]*\\.)?ads\\.com", "load-type": ["third-party"]},
//!   "action": {"type": "block"}}]
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{NetworkRule, PartyScope, RuleAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlockerRule {
    pub trigger: Trigger,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Trigger {
    pub url_filter: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub if_domain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unless_domain: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Block,
    IgnorePreviousRules,
}

impl From<&NetworkRule> for ContentBlockerRule {
    fn from(rule: &NetworkRule) -> Self {
        let load_type = match rule.party_scope {
            PartyScope::Any => Vec::new(),
            PartyScope::FirstParty => vec!["first-party".to_string()],
            PartyScope::ThirdParty => vec!["third-party".to_string()],
        };

        let kind = match rule.action {
            RuleAction::Block => ActionType::Block,
            RuleAction::AllowOverride => ActionType::IgnorePreviousRules,
        };

        Self {
            trigger: Trigger {
                url_filter: rule.url_pattern.clone(),
                resource_type: rule
                    .resource_types
                    .content_blocker_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                load_type,
                if_domain: rule.domain_scope.include.iter().cloned().collect(),
                unless_domain: rule.domain_scope.exclude.iter().cloned().collect(),
            },
            action: Action { kind },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;

    #[test]
    fn scoped_rule_fills_every_trigger_field() {
        let mut rule = NetworkRule::block("ads")
            .with_resource_types(ResourceType::SCRIPT)
            .with_party_scope(PartyScope::ThirdParty);
        rule.domain_scope.include.insert("a.com".to_string());
        rule.domain_scope.exclude.insert("b.com".to_string());

        let json = serde_json::to_value(ContentBlockerRule::from(&rule)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "trigger": {
                    "url-filter": "ads",
                    "resource-type": ["script"],
                    "load-type": ["third-party"],
                    "if-domain": ["a.com"],
                    "unless-domain": ["b.com"]
                },
                "action": {"type": "block"}
            })
        );
    }

    #[test]
    fn unscoped_allow_omits_optional_fields() {
        let json = serde_json::to_value(ContentBlockerRule::from(&NetworkRule::allow("^dumb://"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "trigger": {"url-filter": "^dumb://"},
                "action": {"type": "ignore-previous-rules"}
            })
        );
    }
}
