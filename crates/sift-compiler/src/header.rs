//! Subscription header metadata
//!
//! EasyList-style lists carry `! Key: value` comments at the top. The
//! `Version` marker is what the updater uses as its version token.

/// Only this many leading lines are scanned for header fields.
pub const HEADER_SCAN_LINES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListHeader {
    pub title: Option<String>,
    pub version: Option<String>,
    pub last_modified: Option<String>,
    pub expires: Option<String>,
}

impl ListHeader {
    /// Parse header fields from the first `HEADER_SCAN_LINES` lines of `content`.
    /// Invalid UTF-8 is tolerated since probes may cut a character in half.
    pub fn parse(content: &[u8]) -> Self {
        let text = String::from_utf8_lossy(content);
        let mut header = ListHeader::default();

        for line in text.lines().take(HEADER_SCAN_LINES) {
            let Some(comment) = line.trim().strip_prefix('!') else {
                continue;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            let slot = match key.trim().to_ascii_lowercase().as_str() {
                "title" => &mut header.title,
                "version" => &mut header.version,
                "last modified" | "last-modified" => &mut header.last_modified,
                "expires" => &mut header.expires,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }

        header
    }
}

/// Version marker from the list header, if present.
pub fn extract_version(content: &[u8]) -> Option<String> {
    ListHeader::parse(content).version
}
