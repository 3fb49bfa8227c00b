use sift_core::domain::normalize_domain;
use sift_core::{CompiledFilterSet, DomainScope, NetworkRule, PartyScope, ResourceType, RuleAction};

/// Regex class standing in for the ABP `^` separator placeholder.
pub const SEPARATOR_CLASS: &str = "[^A-Za-z0-9_.%-]";

/// Prefix emitted for a `||` host anchor: scheme, then any subdomain.
pub const HOST_ANCHOR_PREFIX: &str = "^https?://([^/]*\\.)?";

/// What a single line turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Blank, comment, metadata, non-ASCII or unsupported syntax
    Ignored,
    /// Malformed rule, skipped
    Invalid,
    Network,
    /// Cosmetic rule; `exceptions` counts dropped `~domain` entries
    Cosmetic { exceptions: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: usize,
    pub ignored: usize,
    pub invalid: usize,
    pub network: usize,
    pub cosmetic: usize,
    pub cosmetic_exceptions: usize,
}

impl ParseStats {
    fn record(&mut self, outcome: LineOutcome) {
        self.lines += 1;
        match outcome {
            LineOutcome::Ignored => self.ignored += 1,
            LineOutcome::Invalid => self.invalid += 1,
            LineOutcome::Network => self.network += 1,
            LineOutcome::Cosmetic { exceptions } => {
                self.cosmetic += 1;
                self.cosmetic_exceptions += exceptions;
            }
        }
    }
}

/// Compile a whole subscription into a fresh filter set.
pub fn parse_filter_list(text: &str) -> (CompiledFilterSet, ParseStats) {
    let mut compiled = CompiledFilterSet::default();
    let stats = convert_lines(text.lines(), &mut compiled);
    (compiled, stats)
}

/// Convert every line into `out`, skipping anything that does not parse.
pub fn convert_lines<I, S>(lines: I, out: &mut CompiledFilterSet) -> ParseStats
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut stats = ParseStats::default();
    for line in lines {
        let line = line.as_ref();
        let outcome = convert_line(line, out);
        if outcome == LineOutcome::Invalid {
            log::debug!("Skipping malformed filter line: {}", line);
        }
        stats.record(outcome);
    }
    stats
}

/// Convert one subscription line, appending the resulting rule to `out`.
pub fn convert_line(raw_line: &str, out: &mut CompiledFilterSet) -> LineOutcome {
    let line = raw_line.trim();
    if line.is_empty() || is_comment_line(line) {
        return LineOutcome::Ignored;
    }

    // The downstream regex engine only handles ASCII URL patterns
    if !line.is_ascii() {
        return LineOutcome::Ignored;
    }

    if let Some((domains, selector)) = line.split_once("##") {
        return convert_cosmetic(domains, selector, out);
    }

    if is_unsupported_cosmetic(line) {
        return LineOutcome::Ignored;
    }

    match parse_network_filter(line) {
        Some(rule) => {
            out.network_rules.push(rule);
            LineOutcome::Network
        }
        None => LineOutcome::Invalid,
    }
}

fn is_comment_line(line: &str) -> bool {
    line.starts_with('!') || (line.starts_with('[') && line.ends_with(']'))
}

fn is_unsupported_cosmetic(line: &str) -> bool {
    line.contains("#@#") || line.contains("#?#") || line.contains("#$#")
}

fn convert_cosmetic(domain_list: &str, selector: &str, out: &mut CompiledFilterSet) -> LineOutcome {
    if selector.trim().is_empty() {
        return LineOutcome::Invalid;
    }

    if domain_list.is_empty() {
        out.generic_hiding.push(selector.to_string());
        return LineOutcome::Cosmetic { exceptions: 0 };
    }

    let mut exceptions = 0;
    for raw in domain_list.split(',') {
        let domain = raw.trim();
        if domain.is_empty() {
            continue;
        }
        if domain.starts_with('~') {
            // Exception domains are not applied yet
            exceptions += 1;
            continue;
        }
        out.cosmetic_rules.add(&domain.to_ascii_lowercase(), selector);
    }

    LineOutcome::Cosmetic { exceptions }
}

// =============================================================================
// Network filters
// =============================================================================

fn parse_network_filter(line: &str) -> Option<NetworkRule> {
    let (action, line) = match line.strip_prefix("@@") {
        Some(rest) => (RuleAction::AllowOverride, rest),
        None => (RuleAction::Block, line),
    };

    let (pattern_part, options_text) = split_rule_options(line);
    let pattern = pattern_part.trim().replace("\\$", "$");
    let url_pattern = pattern_to_regex(&pattern)?;

    let mut rule = NetworkRule::new(url_pattern, action);
    if let Some(options_text) = options_text {
        apply_options(&mut rule, options_text);
    }
    Some(rule)
}

/// Split on the first `$` that is not escaped with a backslash.
fn split_rule_options(line: &str) -> (&str, Option<&str>) {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'$' && (i == 0 || bytes[i - 1] != b'\\') {
            return (&line[..i], Some(&line[i + 1..]));
        }
    }
    (line, None)
}

fn apply_options(rule: &mut NetworkRule, text: &str) {
    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let option = raw.to_ascii_lowercase();
        let option = option.as_str();

        if let Some(domain_value) = option.strip_prefix("domain=") {
            merge_domain_scope(&mut rule.domain_scope, domain_value);
            continue;
        }

        match option {
            "third-party" | "3p" => rule.party_scope = PartyScope::ThirdParty,
            "~third-party" | "first-party" | "1p" => rule.party_scope = PartyScope::FirstParty,
            name => match ResourceType::from_option(name) {
                Some(mask) => rule.resource_types |= mask,
                None => log::trace!("Ignoring unsupported filter option: {}", name),
            },
        }
    }
}

fn merge_domain_scope(scope: &mut DomainScope, value: &str) {
    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let (is_exclude, domain_raw) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let Some(domain) = normalize_domain(domain_raw) else {
            continue;
        };

        if is_exclude {
            scope.exclude.insert(domain);
        } else {
            scope.include.insert(domain);
        }
    }
}

/// Translate an ABP filter body into a regex source. Returns `None` when
/// nothing remains once anchors are stripped.
pub fn pattern_to_regex(pattern: &str) -> Option<String> {
    let host_anchor = pattern.starts_with("||");
    let left_anchor = !host_anchor && pattern.starts_with('|');
    let right_anchor = pattern.ends_with('|') && !pattern.ends_with("||");

    let mut body = pattern;
    if host_anchor {
        body = &body[2..];
    } else if left_anchor {
        body = &body[1..];
    }
    if right_anchor {
        body = body.strip_suffix('|').unwrap_or(body);
    }

    if body.is_empty() {
        return None;
    }

    let mut regex = String::with_capacity(body.len() + 32);
    if host_anchor {
        regex.push_str(HOST_ANCHOR_PREFIX);
    } else if left_anchor {
        regex.push('^');
    }

    for ch in body.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '^' => regex.push_str(SEPARATOR_CLASS),
            '\\' | '.' | '+' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '$' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }

    if right_anchor {
        regex.push('$');
    }

    Some(regex)
}
