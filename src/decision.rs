//! Direct-rule decision logic.

use ahash::AHashSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::CorpusView;
use crate::corpus::Coverage;
use crate::domain::Domain;
use crate::geo::{Classify, GeoVerdict, Verdict};

/// What should happen to a requested domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recommendation {
    /// Already covered by an existing rule or the CN list
    AlreadyDirect { domain: Domain, coverage: Coverage },
    /// Direct by policy (reserved TLD); nothing to write
    PolicyDirect { domain: Domain },
    /// Classified domestic; should be appended
    AddDirect { domain: Domain, geo: GeoVerdict },
    /// Classified foreign; must not be added
    Reject { domain: Domain, geo: GeoVerdict },
    /// Classification inconclusive
    Undetermined { domain: Domain, geo: GeoVerdict },
}

impl Recommendation {
    pub fn domain(&self) -> &Domain {
        match self {
            Recommendation::AlreadyDirect { domain, .. }
            | Recommendation::PolicyDirect { domain }
            | Recommendation::AddDirect { domain, .. }
            | Recommendation::Reject { domain, .. }
            | Recommendation::Undetermined { domain, .. } => domain,
        }
    }

    /// Classification diagnostics, when a classification ran.
    pub fn geo(&self) -> Option<&GeoVerdict> {
        match self {
            Recommendation::AddDirect { geo, .. }
            | Recommendation::Reject { geo, .. }
            | Recommendation::Undetermined { geo, .. } => Some(geo),
            _ => None,
        }
    }

    /// True when an append is warranted.
    pub fn should_add(&self) -> bool {
        matches!(self, Recommendation::AddDirect { .. })
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::AlreadyDirect { domain, coverage } => match coverage {
                Coverage::DirectList(rule) => {
                    write!(f, "{} is already direct (covered by rule {})", domain, rule)
                }
                Coverage::CnList(entry) => {
                    write!(f, "{} is already direct (in the CN domain list as {})", domain, entry)
                }
            },
            Recommendation::PolicyDirect { domain } => {
                write!(f, "{} is direct by policy (.{} domain)", domain, domain.tld())
            }
            Recommendation::AddDirect { domain, geo } => {
                write!(f, "{} should be added as direct: {}", domain, geo)
            }
            Recommendation::Reject { domain, geo } => {
                write!(f, "{} is not hosted in China and will not be added: {}", domain, geo)
            }
            Recommendation::Undetermined { domain, geo } => {
                write!(f, "could not determine where {} is hosted: {}", domain, geo)
            }
        }
    }
}

/// Read-only query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    PolicyDirect,
    AlreadyDirect(Coverage),
    Classified(GeoVerdict),
}

/// Decides whether a domain should be added as a direct rule.
pub struct DecisionEngine {
    corpus: Arc<dyn CorpusView>,
    classifier: Arc<dyn Classify>,
    policy_tlds: AHashSet<String>,
}

impl DecisionEngine {
    /// Create an engine. The reserved policy TLD set defaults to `cn`.
    pub fn new(corpus: Arc<dyn CorpusView>, classifier: Arc<dyn Classify>) -> Self {
        Self {
            corpus,
            classifier,
            policy_tlds: std::iter::once("cn".to_string()).collect(),
        }
    }

    /// Replace the reserved policy TLDs.
    pub fn with_policy_tlds<I, S>(mut self, tlds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.policy_tlds = tlds
            .into_iter()
            .map(|t| t.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    fn is_policy_direct(&self, domain: &Domain) -> bool {
        self.policy_tlds.contains(domain.tld())
    }

    /// Decide for an already-normalized domain.
    ///
    /// Policy TLDs and covered domains return without touching the network.
    pub async fn decide(&self, domain: &Domain) -> Recommendation {
        let domain = domain.clone();
        match self.lookup(&domain).await {
            Lookup::PolicyDirect => Recommendation::PolicyDirect { domain },
            Lookup::AlreadyDirect(coverage) => Recommendation::AlreadyDirect { domain, coverage },
            Lookup::Classified(geo) => match geo.verdict {
                Verdict::Domestic => Recommendation::AddDirect { domain, geo },
                Verdict::Foreign => Recommendation::Reject { domain, geo },
                Verdict::Unknown => Recommendation::Undetermined { domain, geo },
            },
        }
    }

    /// Report the domain's status without recommending an action.
    pub async fn lookup(&self, domain: &Domain) -> Lookup {
        if self.is_policy_direct(domain) {
            log::debug!("{} is under a policy TLD", domain);
            return Lookup::PolicyDirect;
        }

        if let Some(coverage) = self.corpus.current().coverage(domain) {
            log::debug!("{} already covered: {:?}", domain, coverage);
            return Lookup::AlreadyDirect(coverage);
        }

        Lookup::Classified(self.classifier.classify(domain).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::RuleCorpus;
    use crate::geo::Tally;
    use async_trait::async_trait;

    struct FixedCorpus(Arc<RuleCorpus>);

    impl CorpusView for FixedCorpus {
        fn current(&self) -> Arc<RuleCorpus> {
            self.0.clone()
        }
    }

    /// Fails the test if classification is attempted.
    struct NoNetwork;

    #[async_trait]
    impl Classify for NoNetwork {
        async fn classify(&self, domain: &Domain) -> GeoVerdict {
            panic!("classifier called for {}", domain);
        }
    }

    struct Fixed(Verdict);

    #[async_trait]
    impl Classify for Fixed {
        async fn classify(&self, _domain: &Domain) -> GeoVerdict {
            let vote = match self.0 {
                Verdict::Unknown => None,
                v => Some(v),
            };
            GeoVerdict::new(Tally::from_votes([vote, vote]), Tally::default())
        }
    }

    fn engine(classifier: impl Classify + 'static) -> DecisionEngine {
        let corpus = RuleCorpus::parse(
            "DOMAIN-SUFFIX,mine.com,direct\n",
            "domain:baidu.com\nkeyword:taobao\n",
            "1.0.1.0/24\n",
        );
        DecisionEngine::new(Arc::new(FixedCorpus(Arc::new(corpus))), Arc::new(classifier))
    }

    fn domain(s: &str) -> Domain {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_policy_tld_never_classifies() {
        let rec = engine(NoNetwork).decide(&domain("example.cn")).await;
        assert!(matches!(rec, Recommendation::PolicyDirect { .. }));

        let rec = engine(NoNetwork).decide(&domain("shop.com.cn")).await;
        assert!(matches!(rec, Recommendation::PolicyDirect { .. }));
    }

    #[tokio::test]
    async fn test_covered_never_classifies() {
        let rec = engine(NoNetwork).decide(&domain("mine.com")).await;
        assert_eq!(
            rec,
            Recommendation::AlreadyDirect {
                domain: domain("mine.com"),
                coverage: Coverage::DirectList("mine.com".into()),
            }
        );

        let rec = engine(NoNetwork).decide(&domain("baidu.com")).await;
        assert!(matches!(
            rec,
            Recommendation::AlreadyDirect { coverage: Coverage::CnList(_), .. }
        ));

        let rec = engine(NoNetwork).decide(&domain("taobao.com")).await;
        assert!(matches!(rec, Recommendation::AlreadyDirect { .. }));
    }

    #[tokio::test]
    async fn test_verdict_mapping() {
        let rec = engine(Fixed(Verdict::Domestic)).decide(&domain("new.com")).await;
        assert!(rec.should_add());

        let rec = engine(Fixed(Verdict::Foreign)).decide(&domain("new.com")).await;
        assert!(matches!(rec, Recommendation::Reject { .. }));

        let rec = engine(Fixed(Verdict::Unknown)).decide(&domain("new.com")).await;
        assert!(matches!(rec, Recommendation::Undetermined { .. }));
        assert_eq!(rec.geo().map(|g| g.a.failed), Some(2));
    }

    #[tokio::test]
    async fn test_custom_policy_tlds() {
        let engine = engine(NoNetwork).with_policy_tlds([".hk", "MO"]);
        let rec = engine.decide(&domain("example.hk")).await;
        assert!(matches!(rec, Recommendation::PolicyDirect { .. }));
        assert_eq!(engine.lookup(&domain("mine.com")).await, Lookup::AlreadyDirect(Coverage::DirectList("mine.com".into())));
    }

    #[tokio::test]
    async fn test_lookup_classifies() {
        let lookup = engine(Fixed(Verdict::Foreign)).lookup(&domain("new.com")).await;
        match lookup {
            Lookup::Classified(geo) => assert_eq!(geo.verdict, Verdict::Foreign),
            other => panic!("unexpected {:?}", other),
        }
    }
}
