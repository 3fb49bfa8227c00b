//! Domain helpers
//!
//! # Examples
//!
//! ```
//! use sift_core::domain::ancestors;
//!
//! let chain: Vec<&str> = ancestors("a.b.example.com").collect();
//! assert_eq!(chain, vec!["b.example.com", "example.com"]);
//! ```

/// Strict-suffix ancestors of `domain` that still have at least two labels,
/// nearest first. `www.example.com` yields only `example.com`.
pub fn ancestors(domain: &str) -> impl Iterator<Item = &str> {
    let mut rest = domain;
    std::iter::from_fn(move || {
        let dot = rest.find('.')?;
        let parent = &rest[dot + 1..];
        if !parent.contains('.') {
            return None;
        }
        rest = parent;
        Some(parent)
    })
}

/// Lowercase and validate a hostname. Returns `None` for anything that is not
/// plain ASCII letters, digits, `-` and `.`.
pub fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return None;
    }

    Some(trimmed.to_ascii_lowercase())
}

/// Escape every regex metacharacter so the text matches literally.
pub fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if matches!(
            ch,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_stop_at_two_labels() {
        assert_eq!(ancestors("www.example.com").collect::<Vec<_>>(), vec!["example.com"]);
        assert_eq!(ancestors("example.com").count(), 0);
        assert_eq!(ancestors("localhost").count(), 0);
        assert_eq!(ancestors("").count(), 0);
    }

    #[test]
    fn normalize_rejects_paths_and_lowercases() {
        assert_eq!(normalize_domain("Example.COM"), Some("example.com".to_string()));
        assert_eq!(normalize_domain(".ads.net."), Some("ads.net".to_string()));
        assert_eq!(normalize_domain("ads.net/path"), None);
        assert_eq!(normalize_domain("  "), None);
    }

    #[test]
    fn escape_covers_metacharacters() {
        assert_eq!(escape_regex("a.b*c^"), "a\\.b\\*c\\^");
        assert_eq!(escape_regex("x?y=(1)"), "x\\?y=\\(1\\)");
        assert_eq!(escape_regex("plain"), "plain");
    }
}
