//! Rule line parsing.
//!
//! Understands the line formats found in hosted direct lists and public CN
//! classification lists:
//!
//! - Clash classical: `DOMAIN-SUFFIX,example.com,DIRECT`, `DOMAIN,…`,
//!   `DOMAIN-KEYWORD,…`, `DOMAIN-REGEX,…`
//! - Clash rule-provider payload items: `  - DOMAIN-SUFFIX,example.com`,
//!   `  - '+.example.com'`
//! - Suffix lists: `+.example.com`, `.example.com`, `example.com`
//! - Geosite text: `full:`, `domain:`, `keyword:`, `regexp:`, `include:`
//!
//! Other classical rule types (IP-CIDR, GEOIP, …) are ignored.

use std::fmt;
use std::ops::Range;

/// Kind of a parsed domain rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Matches the domain and all subdomains
    Suffix,
    /// Matches the domain only
    Exact,
    /// Matches when the domain contains the keyword
    Keyword,
    /// Matches when the regex finds a match in the domain
    Regex,
    /// Reference to another list (recorded, not expanded)
    Include,
}

impl RuleKind {
    /// Get the Clash rule type name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Suffix => "DOMAIN-SUFFIX",
            RuleKind::Exact => "DOMAIN",
            RuleKind::Keyword => "DOMAIN-KEYWORD",
            RuleKind::Regex => "DOMAIN-REGEX",
            RuleKind::Include => "INCLUDE",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed rule entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleEntry {
    pub kind: RuleKind,
    /// Normalized value: lower-case for domain kinds, verbatim for regexes
    pub value: String,
}

impl RuleEntry {
    fn new(kind: RuleKind, raw_value: &str) -> Self {
        let value = match kind {
            RuleKind::Regex | RuleKind::Include => raw_value.to_string(),
            _ => raw_value.trim_end_matches('.').to_ascii_lowercase(),
        };
        Self { kind, value }
    }
}

/// A rule entry located inside a source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub entry: RuleEntry,
    /// Byte range of the rule value within the raw line
    pub value: Range<usize>,
    /// Byte range of the whole rule (indentation and comments excluded)
    pub content: Range<usize>,
}

/// Parse a single line. Returns `None` for blank lines, comments, YAML
/// headers and non-domain rules.
pub fn parse_line(raw: &str) -> Option<ParsedLine> {
    let line = raw.trim_end_matches('\r');
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    // Payload header of a Clash rule provider
    if trimmed.trim_end() == "payload:" {
        return None;
    }

    let mut body = strip_inline_comment(trimmed).trim_end();
    let content_start = offset_in(raw, body);
    let content = content_start..content_start + body.len();

    // YAML list item
    if let Some(rest) = body.strip_prefix('-') {
        body = rest.trim_start();
    }
    body = strip_quotes(body);
    if body.is_empty() {
        return None;
    }

    let (kind, value) = classify(body)?;
    if value.is_empty() {
        return None;
    }

    let start = offset_in(raw, value);
    Some(ParsedLine {
        entry: RuleEntry::new(kind, value),
        value: start..start + value.len(),
        content,
    })
}

/// Parse every rule entry in a document.
pub fn parse_document(text: &str) -> Vec<RuleEntry> {
    text.lines()
        .filter_map(parse_line)
        .map(|parsed| parsed.entry)
        .collect()
}

/// Determine the rule kind and raw value of a rule body.
fn classify(body: &str) -> Option<(RuleKind, &str)> {
    if let Some((prefix, rest)) = body.split_once(':') {
        let kind = match prefix.to_ascii_lowercase().as_str() {
            "full" => Some(RuleKind::Exact),
            "domain" => Some(RuleKind::Suffix),
            "keyword" => Some(RuleKind::Keyword),
            "regexp" => Some(RuleKind::Regex),
            "include" | "geosite" => Some(RuleKind::Include),
            _ => None,
        };
        if let Some(kind) = kind {
            let value = match kind {
                RuleKind::Regex => rest.trim(),
                // Geosite attributes such as ":@cn"
                _ => rest.split(":@").next().unwrap_or(rest).trim(),
            };
            return Some((kind, value));
        }
    }

    if body.contains(',') {
        let mut parts = body.splitn(3, ',');
        let rule_type = parts.next()?.trim();
        let value = parts.next()?.trim();
        let kind = match rule_type.to_ascii_uppercase().as_str() {
            "DOMAIN-SUFFIX" => RuleKind::Suffix,
            "DOMAIN" => RuleKind::Exact,
            "DOMAIN-KEYWORD" => RuleKind::Keyword,
            "DOMAIN-REGEX" => RuleKind::Regex,
            _ => return None,
        };
        return Some((kind, value));
    }

    if body.contains(char::is_whitespace) || body.contains(':') {
        return None;
    }
    if let Some(rest) = body.strip_prefix("+.").or_else(|| body.strip_prefix("*.")) {
        return Some((RuleKind::Suffix, rest));
    }
    if let Some(rest) = body.strip_prefix('.') {
        return Some((RuleKind::Suffix, rest));
    }
    if body.contains('.') {
        return Some((RuleKind::Suffix, body));
    }
    None
}

/// Strip a trailing `# comment` that is preceded by whitespace.
fn strip_inline_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && idx > 0 && bytes[idx - 1].is_ascii_whitespace() {
            return &line[..idx];
        }
    }
    line
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Byte offset of `part` within `whole`. `part` must be a sub-slice.
fn offset_in(whole: &str, part: &str) -> usize {
    part.as_ptr() as usize - whole.as_ptr() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str) -> Option<RuleEntry> {
        parse_line(line).map(|parsed| parsed.entry)
    }

    #[test]
    fn test_classical_rules() {
        assert_eq!(
            entry("DOMAIN-SUFFIX,Example.com,DIRECT"),
            Some(RuleEntry { kind: RuleKind::Suffix, value: "example.com".into() })
        );
        assert_eq!(
            entry("DOMAIN,api.example.com"),
            Some(RuleEntry { kind: RuleKind::Exact, value: "api.example.com".into() })
        );
        assert_eq!(entry("DOMAIN-KEYWORD,baidu,direct").unwrap().kind, RuleKind::Keyword);
        assert_eq!(entry("IP-CIDR,10.0.0.0/8,DIRECT"), None);
        assert_eq!(entry("GEOIP,CN,DIRECT"), None);
    }

    #[test]
    fn test_payload_items() {
        assert_eq!(entry("payload:"), None);
        assert_eq!(
            entry("  - DOMAIN-SUFFIX,example.com"),
            Some(RuleEntry { kind: RuleKind::Suffix, value: "example.com".into() })
        );
        assert_eq!(
            entry("  - '+.example.org'"),
            Some(RuleEntry { kind: RuleKind::Suffix, value: "example.org".into() })
        );
    }

    #[test]
    fn test_geosite_lines() {
        assert_eq!(entry("full:www.example.com").unwrap().kind, RuleKind::Exact);
        assert_eq!(
            entry("domain:example.cn:@cn"),
            Some(RuleEntry { kind: RuleKind::Suffix, value: "example.cn".into() })
        );
        assert_eq!(entry("keyword:qq").unwrap().kind, RuleKind::Keyword);
        let regex = entry(r"regexp:^cdn\d+\.example\.com$").unwrap();
        assert_eq!(regex.kind, RuleKind::Regex);
        assert_eq!(regex.value, r"^cdn\d+\.example\.com$");
        assert_eq!(entry("include:category-games-cn").unwrap().kind, RuleKind::Include);
    }

    #[test]
    fn test_suffix_lists() {
        assert_eq!(entry("+.example.com").unwrap().value, "example.com");
        assert_eq!(entry(".example.com").unwrap().value, "example.com");
        assert_eq!(entry("example.com").unwrap().value, "example.com");
        assert_eq!(entry("localhost"), None);
    }

    #[test]
    fn test_comments_and_blanks() {
        assert_eq!(entry(""), None);
        assert_eq!(entry("   "), None);
        assert_eq!(entry("# DOMAIN-SUFFIX,example.com,DIRECT"), None);
        assert_eq!(
            entry("DOMAIN-SUFFIX,example.com,DIRECT # added by hand").unwrap().value,
            "example.com"
        );
    }

    #[test]
    fn test_value_and_content_spans() {
        let raw = "  - DOMAIN-SUFFIX,foo.com,DIRECT  # note";
        let parsed = parse_line(raw).unwrap();
        assert_eq!(&raw[parsed.value.clone()], "foo.com");
        assert_eq!(&raw[parsed.content.clone()], "- DOMAIN-SUFFIX,foo.com,DIRECT");
    }

    #[test]
    fn test_parse_document() {
        let text = "\
# direct rules
DOMAIN-SUFFIX,a.com,DIRECT
DOMAIN-SUFFIX,b.com,DIRECT

IP-CIDR,1.0.0.0/8,DIRECT
";
        let entries = parse_document(text);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == RuleKind::Suffix));
    }
}
