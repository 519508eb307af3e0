//! Entry points used by a chat front end or the CLI.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CorpusView, HttpFetcher, RuleSetCache};
use crate::config::Config;
use crate::decision::{DecisionEngine, Lookup, Recommendation};
use crate::doh::HttpDohTransport;
use crate::domain::{normalize, Domain};
use crate::error::{Error, NotFound, Result, WriteError};
use crate::geo::{Classify, GeoClassifier};
use crate::store::{GitHubStore, RuleStore};
use crate::writer::{AppendOutcome, RemoteRuleWriter};

/// Wires the cache, classifier, decision engine and writer together.
pub struct RuleService {
    cache: Arc<RuleSetCache>,
    engine: DecisionEngine,
    writer: RemoteRuleWriter,
}

impl RuleService {
    pub fn new(cache: Arc<RuleSetCache>, engine: DecisionEngine, writer: RemoteRuleWriter) -> Self {
        Self {
            cache,
            engine,
            writer,
        }
    }

    /// Build a service from configuration, writing through `store`.
    pub fn from_config(config: &Config, store: Arc<dyn RuleStore>) -> Result<Self> {
        let fetcher = HttpFetcher::new(Duration::from_secs(config.sources.fetch_timeout_secs))?;
        let mut cache = RuleSetCache::new(config.source_urls(), Arc::new(fetcher))
            .with_direct_store(store.clone())
            .with_refresh_interval(config.update_interval());
        if let Some(dir) = &config.data_dir {
            cache = cache.with_cache_dir(dir);
        }
        let cache = Arc::new(cache);

        let settings = config.geo_settings();
        let transport = HttpDohTransport::new(settings.query_timeout)
            .map_err(|e| Error::Config(e.to_string()))?
            .with_client_subnet(config.client_subnet()?);
        let classifier: Arc<dyn Classify> = Arc::new(GeoClassifier::new(
            Arc::new(transport),
            cache.clone(),
            settings,
        ));

        let engine = DecisionEngine::new(cache.clone(), classifier)
            .with_policy_tlds(&config.policy_tlds);
        let writer = RemoteRuleWriter::new(store).with_max_attempts(config.max_write_attempts);
        Ok(Self::new(cache, engine, writer))
    }

    /// The GitHub store described by `config`.
    pub fn github_store(config: &Config) -> Result<GitHubStore> {
        let (token, repo, file) = config.github_target()?;
        let mut store = GitHubStore::new(token, repo, file)
            .map_err(|e| Error::Config(e.to_string()))?
            .with_committer(config.committer());
        if let Some(branch) = &config.github.branch {
            store = store.with_branch(branch);
        }
        if let Some(api_base) = &config.github.api_base {
            store = store.with_api_base(api_base);
        }
        Ok(store)
    }

    /// Load the rule corpus from disk or the network.
    ///
    /// A failure is logged and the service keeps running: membership checks
    /// see an empty corpus and address votes abstain until a refresh
    /// succeeds. Returns whether a corpus was loaded.
    pub async fn init(&self) -> bool {
        match self.cache.init().await {
            Ok(corpus) => {
                log::debug!(
                    "Corpus ready: {} direct, {} CN domains, {} CN ranges",
                    corpus.direct_count(),
                    corpus.cn_domain_count(),
                    corpus.cn_range_count()
                );
                true
            }
            Err(e) => {
                log::warn!("Rule corpus unavailable, continuing without it: {}", e);
                false
            }
        }
    }

    pub fn cache(&self) -> &Arc<RuleSetCache> {
        &self.cache
    }

    /// Extract a domain from `text` and report its status.
    pub async fn lookup(&self, text: &str) -> std::result::Result<(Domain, Lookup), NotFound> {
        let domain = normalize(text)?;
        let lookup = self.engine.lookup(&domain).await;
        Ok((domain, lookup))
    }

    /// Extract a domain from `text` and recommend an action.
    pub async fn decide(&self, text: &str) -> std::result::Result<Recommendation, NotFound> {
        let domain = normalize(text)?;
        Ok(self.engine.decide(&domain).await)
    }

    /// Append a direct rule and make it visible to later decisions.
    pub async fn append_rule(
        &self,
        domain: &Domain,
        requested_by: Option<&str>,
    ) -> std::result::Result<AppendOutcome, WriteError> {
        let outcome = self.writer.append_rule_as(domain, requested_by).await?;
        if let AppendOutcome::Committed { .. } = outcome {
            self.cache.record_direct(domain);
        }
        Ok(outcome)
    }
}
