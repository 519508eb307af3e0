//! Domain extraction and registrable-domain reduction.
//!
//! Free-form text (a chat message, a pasted URL) is scanned for the first
//! thing that looks like a host name. URLs are preferred over bare names.
//! The host is then reduced to its registrable domain using a curated
//! public-suffix table; unknown suffixes fall back to the last two labels.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::NotFound;

/// Maximum length of a full domain name.
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single label.
const MAX_LABEL_LEN: usize = 63;

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>"'`\])]+"#).expect("valid URL pattern")
});

static DOMAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}\b")
        .expect("valid domain pattern")
});

/// Multi-label public suffixes we care about. Anything not listed here is
/// treated as a single-label suffix.
static MULTI_LABEL_SUFFIXES: &[&str] = &[
    // China
    "com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn", "ac.cn", "mil.cn",
    "bj.cn", "sh.cn", "tj.cn", "cq.cn", "he.cn", "sx.cn", "nm.cn", "ln.cn",
    "jl.cn", "hl.cn", "js.cn", "zj.cn", "ah.cn", "fj.cn", "jx.cn", "sd.cn",
    "ha.cn", "hb.cn", "hn.cn", "gd.cn", "gx.cn", "hi.cn", "sc.cn", "gz.cn",
    "yn.cn", "xz.cn", "sn.cn", "gs.cn", "qh.cn", "nx.cn", "xj.cn",
    // Hong Kong, Macau, Taiwan
    "com.hk", "net.hk", "org.hk", "edu.hk", "gov.hk", "idv.hk",
    "com.mo", "net.mo", "org.mo",
    "com.tw", "net.tw", "org.tw", "edu.tw", "gov.tw", "idv.tw",
    // United Kingdom
    "co.uk", "org.uk", "me.uk", "ltd.uk", "plc.uk", "net.uk", "ac.uk", "gov.uk",
    // Japan, Korea
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "ad.jp", "ed.jp", "gr.jp",
    "co.kr", "ne.kr", "or.kr", "re.kr", "ac.kr", "go.kr",
    // Asia-Pacific
    "com.sg", "net.sg", "org.sg", "edu.sg", "gov.sg",
    "com.my", "net.my", "org.my",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "id.au",
    "co.nz", "net.nz", "org.nz",
    "co.in", "net.in", "org.in", "firm.in", "gen.in", "ind.in",
    "co.th", "in.th", "or.th",
    "com.vn", "net.vn",
    "com.ph", "com.pk", "com.bd",
    // Elsewhere
    "com.br", "net.br", "org.br",
    "com.ar", "com.mx", "com.co", "com.tr", "com.ru", "com.ua",
    "co.za", "co.il", "co.id",
    // Shared hosting platforms commonly seen in rule lists
    "github.io", "gitlab.io", "pages.dev", "workers.dev", "vercel.app",
    "netlify.app", "herokuapp.com", "blogspot.com", "appspot.com",
];

/// A validated registrable domain, e.g. `example.com` or `example.co.uk`.
///
/// Always lower-case, without a trailing dot, never an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    /// Build a registrable domain from a single host name.
    ///
    /// The host is validated and reduced to its registrable part, so
    /// `www.example.com` yields `example.com`.
    pub fn from_host(host: &str) -> Option<Self> {
        let host = clean_host(host)?;
        registrable(&host).map(Domain)
    }

    /// The domain as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The top-level label, e.g. `cn` for `example.com.cn`.
    pub fn tld(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Iterate over this domain and every parent, longest first.
    ///
    /// `a.example.com` yields `a.example.com`, `example.com`, `com`.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        suffixes_of(&self.0)
    }

    /// Consume and return the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Domain {
    type Err = NotFound;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::from_host(s).ok_or(NotFound)
    }
}

/// Iterate over a name and every parent of it, longest first.
pub(crate) fn suffixes_of(name: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(name);
    std::iter::from_fn(move || {
        let this = current?;
        current = this.find('.').map(|pos| &this[pos + 1..]);
        Some(this)
    })
}

/// Extract the registrable domain of the first plausible host in `text`.
///
/// URLs are scanned first, then bare domain-shaped substrings.
pub fn normalize(text: &str) -> Result<Domain, NotFound> {
    first_host(text)
        .and_then(|host| Domain::from_host(&host))
        .ok_or(NotFound)
}

/// Like [`normalize`], but falls back to a second text (typically the
/// message being replied to) when the first contains no domain.
pub fn normalize_with_fallback(primary: &str, fallback: Option<&str>) -> Result<Domain, NotFound> {
    normalize(primary).or_else(|err| match fallback {
        Some(text) => normalize(text),
        None => Err(err),
    })
}

/// Remove `@bot_name` mentions (case-insensitive) from a message.
pub fn strip_mention(text: &str, bot_name: &str) -> String {
    let bot_name = bot_name.trim_start_matches('@');
    if bot_name.is_empty() {
        return text.to_string();
    }
    let pattern = format!(r"(?i)@{}\b", regex::escape(bot_name));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").trim().to_string(),
        Err(_) => text.to_string(),
    }
}

/// Find the first candidate host in free text.
fn first_host(text: &str) -> Option<String> {
    for url_match in URL_PATTERN.find_iter(text) {
        if let Some(host) = host_from_url(url_match.as_str()) {
            if Domain::from_host(&host).is_some() {
                return Some(host);
            }
        }
    }

    DOMAIN_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .find(|candidate| Domain::from_host(candidate).is_some())
}

/// Host part of a URL, `None` for IP hosts or unparsable URLs.
fn host_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    match parsed.host()? {
        url::Host::Domain(host) => Some(host.to_string()),
        url::Host::Ipv4(_) | url::Host::Ipv6(_) => None,
    }
}

/// Lower-case, strip trailing dots and ports, and validate label syntax.
fn clean_host(host: &str) -> Option<String> {
    let host = host.trim();
    // Drop a port if present ("example.com:8080")
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() || host.len() > MAX_DOMAIN_LEN || host.parse::<IpAddr>().is_ok() {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return None;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return None;
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return None;
        }
    }

    // The top-level label must not be numeric
    let tld = labels[labels.len() - 1];
    if tld.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(host)
}

/// Number of labels in the public suffix of `host`.
fn suffix_label_count(host: &str) -> usize {
    let mut longest = 1;
    for suffix in suffixes_of(host) {
        if MULTI_LABEL_SUFFIXES.contains(&suffix) {
            longest = longest.max(suffix.split('.').count());
        }
    }
    longest
}

/// Reduce a clean host to its registrable domain.
fn registrable(host: &str) -> Option<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let keep = suffix_label_count(host) + 1;
    if labels.len() < keep {
        // The host is itself a public suffix
        return None;
    }
    Some(labels[labels.len() - keep..].join("."))
}
