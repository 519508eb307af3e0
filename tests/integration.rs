//! End-to-end tests: text in, recommendation out, rule file updated.

use async_trait::async_trait;
use rulebot::{
    AppendOutcome, Classify, DecisionEngine, DnsTransport, Domain, DohError, DohProvider, FetchError,
    Fetcher, FileStore, GeoClassifier, GeoSettings, Lookup, QueryKind, Recommendation,
    RemoteRuleWriter, Resolution, RuleService, RuleSetCache, SourceUrls, Verdict,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RULE_FILE: &str = "# direct rules\nDOMAIN-SUFFIX,existing.com,direct\n";
const CN_DOMAINS: &str = "domain:baidu.com\nfull:www.qq.com\nkeyword:taobao\n";
const CN_IPS: &str = "1.0.1.0/24\n36.0.0.0/10\n";

struct StaticFetcher(HashMap<String, String>);

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.0.get(url).cloned().ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Answers A queries with fixed addresses; counts every call.
struct FakeDns {
    addrs: Vec<IpAddr>,
    stall: bool,
    calls: AtomicUsize,
}

impl FakeDns {
    fn answering(addrs: &[&str]) -> Self {
        Self {
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            stall: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn stalled() -> Self {
        Self {
            addrs: Vec::new(),
            stall: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DnsTransport for FakeDns {
    async fn query(
        &self,
        provider: &DohProvider,
        _name: &str,
        kind: QueryKind,
    ) -> Result<Resolution, DohError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        match kind {
            QueryKind::A => Ok(Resolution {
                addrs: self.addrs.clone(),
                names: Vec::new(),
            }),
            QueryKind::Ns => Err(DohError::Status {
                provider: provider.name.clone(),
                status: 503,
            }),
        }
    }
}

struct Harness {
    service: RuleService,
    dns: Arc<FakeDns>,
    rule_file: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new(dns: FakeDns) -> Self {
        let harness = Self::build(dns, true);
        assert!(harness.service.init().await);
        harness
    }

    /// The public CN lists are unreachable.
    async fn without_cn_lists(dns: FakeDns) -> Self {
        let harness = Self::build(dns, false);
        assert!(!harness.service.init().await);
        harness
    }

    fn build(dns: FakeDns, cn_lists_online: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let rule_file = dir.path().join("direct.list");
        std::fs::write(&rule_file, RULE_FILE).unwrap();

        let mut bodies = HashMap::new();
        if cn_lists_online {
            bodies.insert("https://cn.test/domains".to_string(), CN_DOMAINS.to_string());
            bodies.insert("https://cn.test/ipv4".to_string(), CN_IPS.to_string());
        }
        let sources = SourceUrls {
            direct: Vec::new(),
            cn_domains: vec!["https://cn.test/domains".into()],
            cn_ips: vec!["https://cn.test/ipv4".into()],
        };
        let store = Arc::new(FileStore::new(&rule_file));
        let cache = Arc::new(
            RuleSetCache::new(sources, Arc::new(StaticFetcher(bodies))).with_direct_store(store.clone()),
        );

        let dns = Arc::new(dns);
        let settings = GeoSettings {
            a_providers: vec![
                DohProvider::new("alibaba", "https://a.test/dns-query"),
                DohProvider::new("tencent", "https://b.test/dns-query"),
            ],
            ns_providers: Vec::new(),
            retries: 0,
            query_timeout: Duration::from_secs(2),
            deadline: Duration::from_secs(5),
            ..GeoSettings::default()
        };
        let classifier: Arc<dyn Classify> =
            Arc::new(GeoClassifier::new(dns.clone(), cache.clone(), settings));
        let engine = DecisionEngine::new(cache.clone(), classifier);
        let writer = RemoteRuleWriter::new(store);

        Self {
            service: RuleService::new(cache, engine, writer),
            dns,
            rule_file,
            _dir: dir,
        }
    }

    fn rule_file(&self) -> String {
        read(&self.rule_file)
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_domestic_domain_is_added() {
    let harness = Harness::new(FakeDns::answering(&["1.0.1.10"])).await;

    let rec = harness
        .service
        .decide("check http://sub.example.com/path please")
        .await
        .unwrap();
    let domain = match &rec {
        Recommendation::AddDirect { domain, geo } => {
            assert_eq!(geo.a.domestic, 2);
            assert_eq!(geo.verdict, Verdict::Domestic);
            domain.clone()
        }
        other => panic!("expected AddDirect, got {:?}", other),
    };
    assert_eq!(domain.as_str(), "example.com");

    let outcome = harness.service.append_rule(&domain, Some("alice")).await.unwrap();
    assert_eq!(outcome, AppendOutcome::Committed { commit_url: None, duplicate: false });
    assert_eq!(
        harness.rule_file(),
        "# direct rules\nDOMAIN-SUFFIX,existing.com,direct\nDOMAIN-SUFFIX,example.com,direct\n"
    );

    // Visible to later decisions before the next refresh
    let calls = harness.dns.calls.load(Ordering::SeqCst);
    let rec = harness.service.decide("www.example.com").await.unwrap();
    assert!(matches!(rec, Recommendation::AlreadyDirect { .. }));
    assert_eq!(harness.dns.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_policy_tld_makes_no_calls() {
    let harness = Harness::new(FakeDns::answering(&["1.0.1.10"])).await;

    let rec = harness.service.decide("baidu.cn").await.unwrap();
    assert!(matches!(rec, Recommendation::PolicyDirect { .. }));
    assert_eq!(harness.dns.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.rule_file(), RULE_FILE);
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_timing_out() {
    let harness = Harness::new(FakeDns::stalled()).await;

    let rec = harness.service.decide("unknownsite.xyz").await.unwrap();
    match rec {
        Recommendation::Undetermined { domain, geo } => {
            assert_eq!(domain.as_str(), "unknownsite.xyz");
            assert_eq!(geo.a.failed, 2);
            assert_eq!(geo.a.responded(), 0);
        }
        other => panic!("expected Undetermined, got {:?}", other),
    }
    assert_eq!(harness.rule_file(), RULE_FILE);
}

#[tokio::test]
async fn test_foreign_domain_is_rejected() {
    let harness = Harness::new(FakeDns::answering(&["93.184.216.34"])).await;

    let rec = harness.service.decide("https://foreign-site.org").await.unwrap();
    assert!(matches!(rec, Recommendation::Reject { .. }));
    assert_eq!(harness.rule_file(), RULE_FILE);
}

#[tokio::test]
async fn test_covered_domains_skip_the_network() {
    let harness = Harness::new(FakeDns::answering(&["1.0.1.10"])).await;

    for text in ["existing.com", "https://img.existing.com/a.png", "map.baidu.com", "taobao.com"] {
        let (_, lookup) = harness.service.lookup(text).await.unwrap();
        assert!(matches!(lookup, Lookup::AlreadyDirect(_)), "{} -> {:?}", text, lookup);
    }
    assert_eq!(harness.dns.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_text_without_domain() {
    let harness = Harness::new(FakeDns::answering(&["1.0.1.10"])).await;
    assert!(harness.service.decide("hello there").await.is_err());
    assert!(harness.service.lookup("http://127.0.0.1/").await.is_err());
}

#[tokio::test]
async fn test_append_twice_is_idempotent() {
    let harness = Harness::new(FakeDns::answering(&["1.0.1.10"])).await;
    let domain: Domain = "shop.example.net".parse().unwrap();

    harness.service.append_rule(&domain, None).await.unwrap();
    let once = harness.rule_file();
    let outcome = harness.service.append_rule(&domain, None).await.unwrap();
    assert_eq!(outcome, AppendOutcome::Committed { commit_url: None, duplicate: true });
    assert_eq!(harness.rule_file(), once);
}

#[tokio::test]
async fn test_unreachable_cn_lists_do_not_reject() {
    // Domestic resolver answers, but without the CN ranges nothing can be
    // concluded from the address
    let harness = Harness::without_cn_lists(FakeDns::answering(&["114.114.114.114"])).await;

    let rec = harness.service.decide("www.example.com").await.unwrap();
    match rec {
        Recommendation::Undetermined { geo, .. } => {
            assert_eq!(geo.a.foreign, 0);
            assert_eq!(geo.verdict, Verdict::Unknown);
        }
        other => panic!("expected Undetermined, got {:?}", other),
    }
    assert!(harness.dns.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(harness.rule_file(), RULE_FILE);
}
