use std::collections::HashSet;

use sift_core::CompiledFilterSet;

pub struct OptimizeStats {
    pub before: usize,
    pub after: usize,
    pub deduped: usize,
}

/// Drop exact duplicates, keeping the first occurrence so the relative
/// order of block and allow-override rules is unchanged.
pub fn optimize(set: &mut CompiledFilterSet) -> OptimizeStats {
    let before = set.rule_count();

    let mut seen = HashSet::new();
    set.network_rules.retain(|rule| seen.insert(rule.clone()));

    for (_, selectors) in set.cosmetic_rules.iter_mut() {
        dedupe_strings(selectors);
    }
    dedupe_strings(&mut set.generic_hiding);

    let after = set.rule_count();

    OptimizeStats {
        before,
        after,
        deduped: before - after,
    }
}

fn dedupe_strings(items: &mut Vec<String>) {
    let mut seen: HashSet<String> = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use sift_core::RuleAction;

    use super::*;
    use crate::parser::parse_filter_list;

    #[test]
    fn removes_duplicates_across_kinds() {
        let (mut set, _) = parse_filter_list(
            "||ads.com^\n||ads.com^\n@@||ads.com^\n##.ad\n##.ad\nx.com##.b\nx.com,y.com##.b",
        );
        let stats = optimize(&mut set);

        assert_eq!(stats.before, 8);
        assert_eq!(stats.after, 5);
        assert_eq!(stats.deduped, 3);
        assert_eq!(set.network_rules.len(), 2);
        assert_eq!(set.generic_hiding, vec![".ad"]);
        assert_eq!(set.cosmetic_rules.get("x.com").len(), 1);
        assert_eq!(set.cosmetic_rules.get("y.com").len(), 1);
    }

    #[test]
    fn keeps_block_before_allow() {
        let (mut set, _) = parse_filter_list("||a.com^\n@@||a.com^\n||a.com^");
        optimize(&mut set);
        let actions: Vec<_> = set.network_rules.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![RuleAction::Block, RuleAction::AllowOverride]);
    }
}
