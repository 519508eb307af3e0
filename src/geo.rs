//! Geographic classification of a domain by DoH quorum voting.
//!
//! Two independent polls run concurrently:
//!
//! - **A poll**: every A provider resolves the domain; a provider votes
//!   domestic when any returned address lies in the CN ranges of the current
//!   corpus, foreign when it returned addresses and none are CN.
//! - **NS poll**: every NS provider returns the domain's name servers; a
//!   provider votes domestic when a name server belongs to a domestic DNS
//!   operator or resolves to a CN address, foreign otherwise.
//!
//! Address votes need the CN ranges; while the corpus has none, A votes and
//! NS host votes abstain instead of counting as foreign.
//!
//! Providers that fail, time out, or return nothing usable are excluded from
//! their poll. Each poll is decided by strict majority of the providers that
//! voted. The two poll verdicts are then combined with [`combine`].

use async_trait::async_trait;
use futures::future::{select_all, BoxFuture, FutureExt};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::CorpusView;
use crate::corpus::RuleCorpus;
use crate::doh::{DnsTransport, DohProvider, QueryKind, Resolution};
use crate::domain::{suffixes_of, Domain};
use crate::error::DohError;

/// Name server hosts resolved per provider for the NS poll.
const NS_HOSTS_CHECKED: usize = 2;

/// DNS operators whose name servers mark a domain as hosted in mainland China.
pub const DEFAULT_DOMESTIC_NS_SUFFIXES: &[&str] = &[
    "dnspod.net",
    "dnspod.com",
    "hichina.com",
    "alidns.com",
    "dns.la",
    "dnsv2.com",
    "dnsv3.com",
    "dnsv4.com",
    "dnsv5.com",
    "huaweicloud-dns.com",
    "bdydns.com",
    "360safe.com",
    "jdgslb.com",
];

/// Outcome of a poll or of the whole classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Domestic,
    Foreign,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Domestic => "domestic",
            Verdict::Foreign => "foreign",
            Verdict::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Vote counts of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub domestic: usize,
    pub foreign: usize,
    /// Providers that did not produce a vote
    pub failed: usize,
}

impl Tally {
    /// Count provider votes. `None` marks a provider that did not vote.
    pub fn from_votes<I>(votes: I) -> Self
    where
        I: IntoIterator<Item = Option<Verdict>>,
    {
        let mut tally = Tally::default();
        for vote in votes {
            match vote {
                Some(Verdict::Domestic) => tally.domestic += 1,
                Some(Verdict::Foreign) => tally.foreign += 1,
                Some(Verdict::Unknown) | None => tally.failed += 1,
            }
        }
        tally
    }

    /// Providers that voted.
    pub fn responded(&self) -> usize {
        self.domestic + self.foreign
    }

    /// Strict majority of responding providers. Ties and empty polls are
    /// `Unknown`.
    pub fn verdict(&self) -> Verdict {
        let responded = self.responded();
        if self.domestic * 2 > responded {
            Verdict::Domestic
        } else if self.foreign * 2 > responded {
            Verdict::Foreign
        } else {
            Verdict::Unknown
        }
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (domestic {}, foreign {}, no answer {})",
            self.verdict(),
            self.domestic,
            self.foreign,
            self.failed
        )
    }
}

/// Combine the A and NS poll verdicts.
///
/// Either poll domestic wins; otherwise either poll foreign; otherwise
/// unknown.
pub fn combine(a: Verdict, ns: Verdict) -> Verdict {
    match (a, ns) {
        (Verdict::Domestic, _) | (_, Verdict::Domestic) => Verdict::Domestic,
        (Verdict::Foreign, _) | (_, Verdict::Foreign) => Verdict::Foreign,
        _ => Verdict::Unknown,
    }
}

/// Classification result with per-poll diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoVerdict {
    pub verdict: Verdict,
    pub a: Tally,
    pub ns: Tally,
}

impl GeoVerdict {
    pub fn new(a: Tally, ns: Tally) -> Self {
        Self {
            verdict: combine(a.verdict(), ns.verdict()),
            a,
            ns,
        }
    }
}

impl fmt::Display for GeoVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [A: {}; NS: {}]", self.verdict, self.a, self.ns)
    }
}

/// Geographic classifier seam.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, domain: &Domain) -> GeoVerdict;
}

/// Timing, retry and provider settings for [`GeoClassifier`].
#[derive(Debug, Clone)]
pub struct GeoSettings {
    pub a_providers: Vec<DohProvider>,
    pub ns_providers: Vec<DohProvider>,
    /// Timeout of a single DoH exchange
    pub query_timeout: Duration,
    /// Extra attempts after a failed exchange
    pub retries: u32,
    /// Pause between attempts
    pub retry_backoff: Duration,
    /// Budget for a whole classification
    pub deadline: Duration,
    /// Domestic DNS operator domains
    pub domestic_ns_suffixes: Vec<String>,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            a_providers: Vec::new(),
            ns_providers: Vec::new(),
            query_timeout: Duration::from_secs(5),
            retries: 1,
            retry_backoff: Duration::from_millis(200),
            deadline: Duration::from_secs(12),
            domestic_ns_suffixes: DEFAULT_DOMESTIC_NS_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// DoH quorum classifier.
pub struct GeoClassifier {
    transport: Arc<dyn DnsTransport>,
    corpus: Arc<dyn CorpusView>,
    settings: GeoSettings,
}

impl GeoClassifier {
    pub fn new(
        transport: Arc<dyn DnsTransport>,
        corpus: Arc<dyn CorpusView>,
        settings: GeoSettings,
    ) -> Self {
        Self {
            transport,
            corpus,
            settings,
        }
    }

    pub fn settings(&self) -> &GeoSettings {
        &self.settings
    }

    /// Run one poll: fan out to `providers`, collect votes until all have
    /// answered or `deadline` passes.
    async fn poll(
        &self,
        domain: &Domain,
        kind: QueryKind,
        providers: &[DohProvider],
        corpus: &RuleCorpus,
        deadline: Instant,
    ) -> Tally {
        let mut pending: Vec<BoxFuture<'_, (usize, Option<Verdict>)>> = providers
            .iter()
            .enumerate()
            .map(|(idx, provider)| {
                async move {
                    let vote = match kind {
                        QueryKind::A => self.a_vote(provider, domain, corpus).await,
                        QueryKind::Ns => self.ns_vote(provider, domain, corpus).await,
                    };
                    (idx, vote)
                }
                .boxed()
            })
            .collect();

        let mut votes = Vec::with_capacity(providers.len());
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, select_all(pending)).await {
                Ok(((idx, vote), _, remaining)) => {
                    log::debug!(
                        "{} vote for {} from {}: {:?}",
                        kind,
                        domain,
                        providers[idx],
                        vote
                    );
                    votes.push(vote);
                    pending = remaining;
                }
                Err(_) => {
                    // The select_all future owned the stragglers; they are
                    // dropped with it.
                    let outstanding = providers.len() - votes.len();
                    log::warn!(
                        "{} poll for {} hit the deadline with {} provider(s) outstanding",
                        kind,
                        domain,
                        outstanding
                    );
                    votes.extend(std::iter::repeat(None).take(outstanding));
                    break;
                }
            }
        }

        Tally::from_votes(votes)
    }

    async fn a_vote(
        &self,
        provider: &DohProvider,
        domain: &Domain,
        corpus: &RuleCorpus,
    ) -> Option<Verdict> {
        let resolution = self.resolve(provider, domain.as_str(), QueryKind::A).await?;
        address_vote(&resolution.addrs, corpus)
    }

    async fn ns_vote(
        &self,
        provider: &DohProvider,
        domain: &Domain,
        corpus: &RuleCorpus,
    ) -> Option<Verdict> {
        let resolution = self.resolve(provider, domain.as_str(), QueryKind::Ns).await?;
        if resolution.names.is_empty() {
            return None;
        }

        if resolution
            .names
            .iter()
            .any(|host| self.is_domestic_operator(host))
        {
            return Some(Verdict::Domestic);
        }

        let mut addrs = Vec::new();
        for host in resolution.names.iter().take(NS_HOSTS_CHECKED) {
            if let Some(found) = self.resolve(provider, host, QueryKind::A).await {
                addrs.extend(found.addrs);
            }
        }
        address_vote(&addrs, corpus)
    }

    fn is_domestic_operator(&self, host: &str) -> bool {
        suffixes_of(host).any(|suffix| {
            self.settings
                .domestic_ns_suffixes
                .iter()
                .any(|operator| operator == suffix)
        })
    }

    /// Query with per-attempt timeout and bounded retries. `None` when every
    /// attempt failed.
    async fn resolve(&self, provider: &DohProvider, name: &str, kind: QueryKind) -> Option<Resolution> {
        let attempts = self.settings.retries + 1;
        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.settings.query_timeout,
                self.transport.query(provider, name, kind),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DohError::Timeout {
                    provider: provider.name.clone(),
                    after: self.settings.query_timeout,
                })
            });

            match result {
                Ok(resolution) => return Some(resolution),
                Err(e) => {
                    log::debug!(
                        "{} query for {} via {} failed (attempt {}/{}): {}",
                        kind,
                        name,
                        provider,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Classify for GeoClassifier {
    async fn classify(&self, domain: &Domain) -> GeoVerdict {
        let corpus = self.corpus.current();
        let deadline = Instant::now() + self.settings.deadline;

        let (a, ns) = tokio::join!(
            self.poll(domain, QueryKind::A, &self.settings.a_providers, &corpus, deadline),
            self.poll(domain, QueryKind::Ns, &self.settings.ns_providers, &corpus, deadline),
        );

        let verdict = GeoVerdict::new(a, ns);
        log::info!("Classified {}: {}", domain, verdict);
        verdict
    }
}

/// Vote from a set of resolved addresses. Without CN ranges there is
/// nothing to compare against, so the provider abstains.
fn address_vote(addrs: &[IpAddr], corpus: &RuleCorpus) -> Option<Verdict> {
    if addrs.is_empty() || corpus.cn_range_count() == 0 {
        None
    } else if addrs.iter().any(|ip| corpus.is_cn_ip(*ip)) {
        Some(Verdict::Domestic)
    } else {
        Some(Verdict::Foreign)
    }
}
