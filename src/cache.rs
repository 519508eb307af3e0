//! Process-wide rule corpus cache with periodic refresh.
//!
//! This module provides `RuleSetCache` which handles:
//! - Downloading the project's direct list and the public CN lists
//! - Reading the direct list through the rule store when one is attached
//! - Mirror fallback per source
//! - Atomic snapshot replacement (readers never block, never see a
//!   half-built corpus)
//! - Keeping the previous snapshot when any source fails
//! - An optional on-disk copy for fast, network-free startup

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::corpus::RuleCorpus;
use crate::domain::Domain;
use crate::error::FetchError;
use crate::metadata::UpdateMetadata;
use crate::store::RuleStore;

/// Default refresh interval (6 hours).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default timeout for a single source download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

const DIRECT_FILE: &str = "direct.list";
const CN_DOMAINS_FILE: &str = "cn-domains.txt";
const CN_IPS_FILE: &str = "cn-ipv4.txt";
const METADATA_FILE: &str = "corpus.meta";

/// Read access to the latest corpus snapshot.
pub trait CorpusView: Send + Sync {
    /// The latest completed snapshot. Never blocks.
    fn current(&self) -> Arc<RuleCorpus>;
}

/// Downloads a text document.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rulebot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Http {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        // Local rule files are served from disk
        if let Some(path) = url::Url::parse(url)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
        {
            return Ok(tokio::fs::read_to_string(path).await?);
        }

        let http_err = |e: reqwest::Error| FetchError::Http {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(http_err)
    }
}

/// Mirror URLs for each corpus source, tried in order.
#[derive(Debug, Clone, Default)]
pub struct SourceUrls {
    /// The project's own direct-rule file
    pub direct: Vec<String>,
    /// Public CN domain list (geosite text format)
    pub cn_domains: Vec<String>,
    /// Public CN IPv4 CIDR list
    pub cn_ips: Vec<String>,
}

/// Raw documents of one successful fetch.
struct Documents {
    direct: String,
    cn_domains: String,
    cn_ips: String,
    sources: Vec<String>,
}

/// Rule corpus cache.
///
/// # Example
///
/// ```ignore
/// use rulebot::cache::{HttpFetcher, RuleSetCache, SourceUrls};
/// use std::sync::Arc;
///
/// let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(60))?);
/// let cache = Arc::new(RuleSetCache::new(urls, fetcher));
///
/// // Load from disk or download
/// cache.init().await?;
///
/// // Refresh every 6 hours in the background
/// let handle = cache.clone().spawn_refresh_loop();
///
/// let corpus = cache.current();
/// ```
pub struct RuleSetCache {
    snapshot: ArcSwap<RuleCorpus>,
    sources: SourceUrls,
    fetcher: Arc<dyn Fetcher>,
    /// Authoritative source of the direct list, tried before its mirrors
    direct_store: Option<Arc<dyn RuleStore>>,
    cache_dir: Option<PathBuf>,
    refresh_interval: Duration,
    /// Held for the duration of a refresh
    refreshing: Mutex<()>,
}

impl RuleSetCache {
    /// Create an empty cache. Call [`RuleSetCache::init`] or
    /// [`RuleSetCache::refresh`] to load data.
    pub fn new(sources: SourceUrls, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleCorpus::empty()),
            sources,
            fetcher,
            direct_store: None,
            cache_dir: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refreshing: Mutex::new(()),
        }
    }

    /// Keep a copy of fetched documents in `dir`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Read the direct list from `store` first. The direct mirror URLs are
    /// only used when the store cannot be read.
    pub fn with_direct_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.direct_store = Some(store);
        self
    }

    /// Set a custom refresh interval. Default is 6 hours.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// The configured refresh interval.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Initialize: load a fresh disk copy, or download.
    ///
    /// If the download fails, a stale disk copy is used when available.
    pub async fn init(&self) -> Result<Arc<RuleCorpus>, FetchError> {
        if let Some(dir) = &self.cache_dir {
            tokio::fs::create_dir_all(dir).await?;
            let meta = UpdateMetadata::load(dir.join(METADATA_FILE)).unwrap_or_default();
            if !meta.needs_update(self.refresh_interval) {
                match self.load_from_disk(dir, &meta).await {
                    Ok(corpus) => {
                        log::info!("Loaded rule corpus from cache: {:?}", dir);
                        return Ok(corpus);
                    }
                    Err(e) => log::warn!("Failed to load cached corpus, will download: {}", e),
                }
            }
        }

        match self.refresh().await {
            Ok(corpus) => Ok(corpus),
            Err(e) => {
                let dir = match &self.cache_dir {
                    Some(dir) => dir,
                    None => return Err(e),
                };
                log::warn!("Initial corpus download failed ({}), trying stale cache", e);
                let meta = UpdateMetadata::load(dir.join(METADATA_FILE)).unwrap_or_default();
                self.load_from_disk(dir, &meta).await.map_err(|_| e)
            }
        }
    }

    /// Fetch all sources and swap in a new snapshot.
    ///
    /// The shared snapshot is only replaced when every source succeeds.
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<RuleCorpus>, FetchError> {
        let _guard = self.refreshing.try_lock().map_err(|_| {
            log::info!("Corpus refresh already running, skipping");
            FetchError::Busy
        })?;

        log::info!("Refreshing rule corpus...");
        let docs = match self.fetch_documents().await {
            Ok(docs) => docs,
            Err(e) => {
                log::warn!("Corpus refresh failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };

        let corpus = RuleCorpus::parse(&docs.direct, &docs.cn_domains, &docs.cn_ips);
        if corpus.cn_domain_count() == 0 {
            log::warn!("CN domain list parsed to nothing, keeping previous snapshot");
            return Err(FetchError::Empty {
                source_name: "CN domain list".to_string(),
            });
        }
        if corpus.cn_range_count() == 0 {
            log::warn!("CN IP list parsed to nothing, keeping previous snapshot");
            return Err(FetchError::Empty {
                source_name: "CN IP list".to_string(),
            });
        }

        if let Some(dir) = &self.cache_dir {
            if let Err(e) = save_to_disk(dir, &docs).await {
                log::warn!("Failed to write corpus cache to {:?}: {}", dir, e);
            }
        }

        let corpus = Arc::new(corpus);
        self.snapshot.store(corpus.clone());
        log::info!(
            "Rule corpus refreshed: {} direct suffixes, {} CN domains, {} CN IP ranges",
            corpus.direct_count(),
            corpus.cn_domain_count(),
            corpus.cn_range_count()
        );
        Ok(corpus)
    }

    /// Record a freshly appended direct rule in the live snapshot.
    ///
    /// Builds a new snapshot with the domain added and swaps it in, so
    /// decisions made before the next refresh already see the rule.
    pub fn record_direct(&self, domain: &Domain) {
        self.snapshot
            .rcu(|current| Arc::new(current.with_direct(domain)));
        log::debug!("Recorded {} in the live corpus", domain);
    }

    /// Spawn the periodic refresh task.
    ///
    /// The first refresh happens one interval from now. Failures are logged
    /// and the loop keeps going.
    pub fn spawn_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        // interval_at panics on a zero period
        let period = self.refresh_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!("Scheduled corpus refresh every {:?}", period);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    log::error!("Scheduled corpus refresh failed: {}", e);
                }
            }
        })
    }

    /// Fetch the three documents concurrently.
    async fn fetch_documents(&self) -> Result<Documents, FetchError> {
        let (direct, cn_domains, cn_ips) = tokio::try_join!(
            self.fetch_direct(),
            self.fetch_source("CN domain list", &self.sources.cn_domains),
            self.fetch_source("CN IP list", &self.sources.cn_ips),
        )?;
        Ok(Documents {
            sources: vec![direct.0, cn_domains.0, cn_ips.0],
            direct: direct.1,
            cn_domains: cn_domains.1,
            cn_ips: cn_ips.1,
        })
    }

    /// The direct list from the attached store, else from its mirrors.
    async fn fetch_direct(&self) -> Result<(String, String), FetchError> {
        if let Some(store) = &self.direct_store {
            match store.fetch().await {
                Ok(revision) => {
                    log::debug!(
                        "Fetched direct list from {} ({} bytes)",
                        store.describe(),
                        revision.content.len()
                    );
                    return Ok((store.describe(), revision.content));
                }
                Err(e) => log::warn!("Failed to read direct list from {}: {}", store.describe(), e),
            }
        }
        self.fetch_source("direct list", &self.sources.direct).await
    }

    /// Try each mirror in order, returning the first success.
    async fn fetch_source(
        &self,
        name: &str,
        mirrors: &[String],
    ) -> Result<(String, String), FetchError> {
        for url in mirrors {
            match self.fetcher.fetch(url).await {
                Ok(body) => {
                    log::debug!("Fetched {} from {} ({} bytes)", name, url, body.len());
                    return Ok((url.clone(), body));
                }
                Err(e) => log::warn!("Failed to fetch {} from {}: {}", name, url, e),
            }
        }
        Err(FetchError::AllMirrorsFailed {
            source_name: name.to_string(),
        })
    }

    /// Load documents from the disk cache and swap them in.
    async fn load_from_disk(
        &self,
        dir: &Path,
        meta: &UpdateMetadata,
    ) -> Result<Arc<RuleCorpus>, FetchError> {
        let direct = tokio::fs::read_to_string(dir.join(DIRECT_FILE)).await?;
        let cn_domains = tokio::fs::read_to_string(dir.join(CN_DOMAINS_FILE)).await?;
        let cn_ips = tokio::fs::read_to_string(dir.join(CN_IPS_FILE)).await?;

        let mut corpus = RuleCorpus::parse(&direct, &cn_domains, &cn_ips);
        if let Some(fetched_at) = meta.last_updated {
            corpus = corpus.with_fetched_at(fetched_at);
        }
        if corpus.cn_domain_count() == 0 || corpus.cn_range_count() == 0 {
            return Err(FetchError::Empty {
                source_name: format!("cache at {:?}", dir),
            });
        }

        let corpus = Arc::new(corpus);
        self.snapshot.store(corpus.clone());
        Ok(corpus)
    }
}

impl CorpusView for RuleSetCache {
    fn current(&self) -> Arc<RuleCorpus> {
        self.snapshot.load_full()
    }
}

/// Write documents atomically: temp file then rename.
async fn save_to_disk(dir: &Path, docs: &Documents) -> Result<(), FetchError> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, body) in [
        (DIRECT_FILE, &docs.direct),
        (CN_DOMAINS_FILE, &docs.cn_domains),
        (CN_IPS_FILE, &docs.cn_ips),
    ] {
        write_atomic(&dir.join(name), body.as_bytes()).await?;
    }

    let meta = UpdateMetadata::now(docs.sources.clone());
    let json = meta
        .to_json()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    write_atomic(&dir.join(METADATA_FILE), json.as_bytes()).await?;
    Ok(())
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, data).await?;
    tokio::fs::rename(&temp_path, path).await
}
