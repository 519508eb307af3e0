//! Immutable rule corpus snapshots.
//!
//! A [`RuleCorpus`] bundles everything membership checks and IP
//! classification need: the project's own direct suffixes, the public CN
//! domain list and the CN IP ranges. Snapshots are never mutated; a new one
//! is built and swapped in by [`crate::cache::RuleSetCache`].

use ahash::AHashSet;
use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

use crate::domain::{suffixes_of, Domain};
use crate::rules::{parse_document, RuleEntry, RuleKind};

/// Why a domain is considered covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// A suffix rule in the project's own list
    DirectList(String),
    /// An entry in the public CN classification list
    CnList(String),
}

/// Domain entries of the public CN classification list.
#[derive(Debug, Default, Clone)]
pub struct CnDomainSet {
    /// `full:` entries, matched exactly
    exacts: AHashSet<String>,
    /// `domain:` and bare entries, matched as suffixes
    suffixes: AHashSet<String>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
    /// `include:` references, recorded but not expanded
    includes: Vec<String>,
}

impl CnDomainSet {
    /// Build from a geosite-style document.
    pub fn parse(text: &str) -> Self {
        let mut set = Self::default();
        for entry in parse_document(text) {
            set.insert(entry);
        }
        if !set.includes.is_empty() {
            log::warn!(
                "CN domain list references {} include lists, which are not expanded",
                set.includes.len()
            );
        }
        set
    }

    fn insert(&mut self, entry: RuleEntry) {
        match entry.kind {
            RuleKind::Exact => {
                self.exacts.insert(entry.value);
            }
            RuleKind::Suffix => {
                self.suffixes.insert(entry.value);
            }
            RuleKind::Keyword => self.keywords.push(entry.value),
            RuleKind::Regex => match Regex::new(&format!("(?i){}", entry.value)) {
                Ok(re) => self.regexes.push(re),
                Err(e) => log::warn!("Skipping invalid CN list regex {}: {}", entry.value, e),
            },
            RuleKind::Include => self.includes.push(entry.value),
        }
    }

    /// Total number of usable entries.
    pub fn len(&self) -> usize {
        self.exacts.len() + self.suffixes.len() + self.keywords.len() + self.regexes.len()
    }

    /// Check if the set holds no usable entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the entry covering `name`, if any.
    fn matching(&self, name: &str) -> Option<String> {
        if self.exacts.contains(name) {
            return Some(name.to_string());
        }
        if let Some(suffix) = suffixes_of(name).find(|s| self.suffixes.contains(*s)) {
            return Some(suffix.to_string());
        }
        if let Some(keyword) = self.keywords.iter().find(|k| name.contains(k.as_str())) {
            return Some(format!("keyword:{}", keyword));
        }
        self.regexes
            .iter()
            .find(|re| re.is_match(name))
            .map(|re| format!("regexp:{}", re.as_str()))
    }
}

/// CN IP ranges.
///
/// IPv4 networks are merged into sorted, non-overlapping ranges and looked
/// up by binary search. IPv6 networks are few and scanned linearly.
#[derive(Debug, Default, Clone)]
pub struct IpRangeSet {
    v4: Vec<(u32, u32)>,
    v6: Vec<Ipv6Net>,
}

impl IpRangeSet {
    /// Parse a CIDR-per-line document. Invalid lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        let mut invalid = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Tolerate classical "IP-CIDR,1.0.1.0/24,DIRECT" lines as well
            let cidr = match line.split(',').collect::<Vec<_>>().as_slice() {
                [_, cidr, ..] => cidr.trim(),
                _ => line,
            };

            if let Ok(net) = cidr.parse::<Ipv4Net>() {
                v4.push(net);
            } else if let Ok(net) = cidr.parse::<Ipv6Net>() {
                v6.push(net);
            } else if let Ok(addr) = cidr.parse::<Ipv4Addr>() {
                v4.push(Ipv4Net::from(addr));
            } else {
                invalid += 1;
            }
        }

        if invalid > 0 {
            log::debug!("Skipped {} invalid CIDR lines", invalid);
        }

        Self::from_networks(v4, v6)
    }

    /// Build from parsed networks.
    pub fn from_networks(v4: Vec<Ipv4Net>, v6: Vec<Ipv6Net>) -> Self {
        let mut ranges: Vec<(u32, u32)> = v4
            .iter()
            .map(|net| (u32::from(net.network()), u32::from(net.broadcast())))
            .collect();
        ranges.sort_unstable_by_key(|(start, _)| *start);

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        Self { v4: merged, v6 }
    }

    /// Check if an address falls inside any range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains_v4(v4),
            IpAddr::V6(v6) => self.contains_v6(v6),
        }
    }

    fn contains_v4(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        let idx = self.v4.partition_point(|(start, _)| *start <= ip);
        idx > 0 && ip <= self.v4[idx - 1].1
    }

    fn contains_v6(&self, ip: Ipv6Addr) -> bool {
        self.v6.iter().any(|net| net.contains(&ip))
    }

    /// Number of merged IPv4 ranges plus IPv6 networks.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Check if no ranges are loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable, timestamped snapshot of all rule sources.
#[derive(Debug, Clone)]
pub struct RuleCorpus {
    /// Suffix entries of the project's own direct list
    direct: AHashSet<String>,
    cn_domains: CnDomainSet,
    cn_ips: IpRangeSet,
    fetched_at: SystemTime,
}

impl RuleCorpus {
    /// Assemble a corpus from already-parsed parts.
    pub fn new(direct: AHashSet<String>, cn_domains: CnDomainSet, cn_ips: IpRangeSet) -> Self {
        Self {
            direct,
            cn_domains,
            cn_ips,
            fetched_at: SystemTime::now(),
        }
    }

    /// An empty corpus, used before the first successful refresh.
    pub fn empty() -> Self {
        Self::new(AHashSet::new(), CnDomainSet::default(), IpRangeSet::default())
    }

    /// Parse the three source documents into a corpus.
    pub fn parse(direct_list: &str, cn_domain_list: &str, cn_ip_list: &str) -> Self {
        Self::new(
            parse_direct_suffixes(direct_list),
            CnDomainSet::parse(cn_domain_list),
            IpRangeSet::parse(cn_ip_list),
        )
    }

    /// Override the snapshot timestamp (used when loading from disk).
    pub fn with_fetched_at(mut self, fetched_at: SystemTime) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// A copy of this corpus with one more own-list suffix.
    pub fn with_direct(&self, domain: &Domain) -> Self {
        let mut next = self.clone();
        next.direct.insert(domain.as_str().to_string());
        next
    }

    /// Return why `domain` is covered, if it is.
    ///
    /// A domain is covered when it equals or is a subdomain of an own-list
    /// suffix, or matches any entry of the CN domain list.
    pub fn coverage(&self, domain: &Domain) -> Option<Coverage> {
        let name = domain.as_str();
        if let Some(suffix) = suffixes_of(name).find(|s| self.direct.contains(*s)) {
            return Some(Coverage::DirectList(suffix.to_string()));
        }
        self.cn_domains.matching(name).map(Coverage::CnList)
    }

    /// Check if `domain` is covered by either list.
    pub fn contains(&self, domain: &Domain) -> bool {
        self.coverage(domain).is_some()
    }

    /// Check if an address is a CN address.
    pub fn is_cn_ip(&self, ip: IpAddr) -> bool {
        self.cn_ips.contains(ip)
    }

    /// Number of own-list suffixes.
    pub fn direct_count(&self) -> usize {
        self.direct.len()
    }

    /// Number of CN domain entries.
    pub fn cn_domain_count(&self) -> usize {
        self.cn_domains.len()
    }

    /// Number of CN IP ranges.
    pub fn cn_range_count(&self) -> usize {
        self.cn_ips.len()
    }

    /// When the sources of this snapshot were fetched.
    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }
}

/// Collect the suffix entries of the project's own direct list.
///
/// Exact `DOMAIN` rules are kept as well: the list only ever gains
/// registrable domains, so an exact rule for one still counts as covering it.
fn parse_direct_suffixes(text: &str) -> AHashSet<String> {
    parse_document(text)
        .into_iter()
        .filter(|entry| matches!(entry.kind, RuleKind::Suffix | RuleKind::Exact))
        .map(|entry| entry.value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(s: &str) -> Domain {
        s.parse().unwrap()
    }

    #[test]
    fn test_direct_suffix_coverage() {
        let corpus = RuleCorpus::parse("DOMAIN-SUFFIX,example.com,direct\n", "", "");

        assert!(corpus.contains(&domain("example.com")));
        assert_eq!(
            corpus.coverage(&domain("example.com")),
            Some(Coverage::DirectList("example.com".into()))
        );
        assert!(!corpus.contains(&domain("notexample.com")));
        assert!(!corpus.contains(&domain("example.org")));
    }

    #[test]
    fn test_cn_list_coverage() {
        let cn = "\
full:www.exact.com
domain:suffix.com
keyword:taobao
regexp:^cdn[0-9]+\\.
plain.cn.example
";
        let corpus = RuleCorpus::parse("", cn, "");

        assert_eq!(
            corpus.coverage(&domain("suffix.com")),
            Some(Coverage::CnList("suffix.com".into()))
        );
        assert!(corpus.contains(&domain("mytaobao.com")));
        assert!(!corpus.contains(&domain("exact.com")));
        assert_eq!(corpus.cn_domain_count(), 5);
    }

    #[test]
    fn test_cn_exact_and_regex_match_full_names() {
        let set = CnDomainSet::parse("full:www.exact.com\nregexp:^cdn[0-9]+\\.\n");
        assert!(set.matching("www.exact.com").is_some());
        assert!(set.matching("cdn42.example.com").is_some());
        assert!(set.matching("cdn.example.com").is_none());
    }

    #[test]
    fn test_ip_ranges() {
        let ranges = IpRangeSet::parse("1.0.1.0/24\n1.0.2.0/23\n# comment\n36.0.0.0/10\n240e::/20\nbad\n");

        // 1.0.1.0/24 and 1.0.2.0/23 are adjacent and merge
        assert_eq!(ranges.len(), 3);
        assert!(ranges.contains("1.0.1.5".parse().unwrap()));
        assert!(ranges.contains("1.0.3.255".parse().unwrap()));
        assert!(ranges.contains("36.63.255.255".parse().unwrap()));
        assert!(!ranges.contains("1.0.4.0".parse().unwrap()));
        assert!(!ranges.contains("8.8.8.8".parse().unwrap()));
        assert!(!ranges.contains("0.0.0.1".parse().unwrap()));
        assert!(ranges.contains("240e:1::1".parse().unwrap()));
        assert!(!ranges.contains("2001:4860::1".parse().unwrap()));
    }

    #[test]
    fn test_overlapping_ranges_merge() {
        let ranges = IpRangeSet::parse("10.0.0.0/8\n10.1.0.0/16\n");
        assert_eq!(ranges.len(), 1);
        assert!(ranges.contains("10.255.0.1".parse().unwrap()));
    }

    #[test]
    fn test_with_direct_is_copy_on_write() {
        let corpus = RuleCorpus::empty();
        let next = corpus.with_direct(&domain("example.com"));

        assert!(!corpus.contains(&domain("example.com")));
        assert!(next.contains(&domain("example.com")));
        assert_eq!(next.direct_count(), 1);
    }
}
