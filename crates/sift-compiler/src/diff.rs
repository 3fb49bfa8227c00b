//! Line-level diff between two revisions of a subscription.
//!
//! Lines are compared by their trimmed text as a set, so reordering a list
//! produces an empty diff.

use std::collections::HashSet;

use sift_core::CompiledFilterSet;

use crate::parser::{convert_lines, ParseStats};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineDiff {
    /// In the current revision but not the previous one, in current order
    pub added: Vec<String>,
    /// In the previous revision but not the current one, in previous order
    pub removed: Vec<String>,
}

impl LineDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Rules to add and rules to take away, compiled from a `LineDiff`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterDelta {
    pub added: CompiledFilterSet,
    pub removed: CompiledFilterSet,
}

impl FilterDelta {
    /// Remove first, then add, so a line that moved between revisions
    /// is never lost.
    pub fn apply_to(self, target: &mut CompiledFilterSet) -> usize {
        let removed = target.subtract(&self.removed);
        target.merge(self.added);
        removed
    }
}

pub fn diff_lines(previous: &str, current: &str) -> LineDiff {
    let prev_set = line_set(previous);
    let curr_set = line_set(current);

    LineDiff {
        added: ordered_difference(current, &prev_set),
        removed: ordered_difference(previous, &curr_set),
    }
}

/// Run both sides of a diff through the converter.
pub fn compile_delta(diff: &LineDiff) -> FilterDelta {
    let mut delta = FilterDelta::default();
    convert_lines(&diff.added, &mut delta.added);
    convert_lines(&diff.removed, &mut delta.removed);
    delta
}

/// Compile each distinct line of `text` once, in first-seen order.
///
/// This is the baseline that `diff_lines` deltas are applied against: a
/// removed line takes away exactly the rules it contributed here.
pub fn compile_snapshot(text: &str) -> (CompiledFilterSet, ParseStats) {
    let mut seen = HashSet::new();
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && seen.insert(*line));
    let mut compiled = CompiledFilterSet::default();
    let stats = convert_lines(lines, &mut compiled);
    (compiled, stats)
}

fn line_set(text: &str) -> HashSet<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

fn ordered_difference(text: &str, other: &HashSet<&str>) -> Vec<String> {
    let mut emitted = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !other.contains(line) && emitted.insert(*line))
        .map(str::to_string)
        .collect()
}
