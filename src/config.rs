//! Runtime configuration.
//!
//! Loaded from an optional YAML file and then overlaid with environment
//! variables, so a container deployment can be configured with env alone.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{SourceUrls, DEFAULT_REFRESH_INTERVAL};
use crate::doh::{DohProvider, DEFAULT_CLIENT_SUBNET};
use crate::error::{Error, Result};
use crate::geo::{GeoSettings, DEFAULT_DOMESTIC_NS_SUFFIXES};
use crate::store::Committer;
use crate::writer::DEFAULT_MAX_ATTEMPTS;

/// Public CN domain list (geosite text format).
pub const DEFAULT_CN_DOMAIN_URL: &str =
    "https://raw.githubusercontent.com/Loyalsoldier/v2ray-rules-dat/refs/heads/release/direct-list.txt";

/// Public CN IPv4 list mirrors.
pub const DEFAULT_CN_IPV4_URLS: &[&str] = &[
    "https://raw.githubusercontent.com/Aethersailor/geoip/refs/heads/release/text/cn-ipv4.txt",
    "https://gcore.jsdelivr.net/gh/Aethersailor/geoip@release/text/cn-ipv4.txt",
    "https://testingcf.jsdelivr.net/gh/Aethersailor/geoip@release/text/cn-ipv4.txt",
];

/// A-record providers. Domestic resolvers return the addresses mainland
/// users would actually reach.
pub fn default_a_providers() -> Vec<DohProvider> {
    vec![
        DohProvider::new("alibaba", "https://dns.alidns.com/dns-query"),
        DohProvider::new("tencent", "https://doh.pub/dns-query"),
        DohProvider::new("cloudflare", "https://cloudflare-dns.com/dns-query"),
    ]
}

/// NS-record providers.
pub fn default_ns_providers() -> Vec<DohProvider> {
    vec![
        DohProvider::new("cloudflare", "https://cloudflare-dns.com/dns-query"),
        DohProvider::new("google", "https://dns.google/dns-query"),
        DohProvider::new("quad9", "https://dns.quad9.net/dns-query"),
    ]
}

/// Hosted rule file settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub token: Option<String>,
    /// `owner/name`
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// Path of the direct rule file inside the repository
    pub rule_file: Option<String>,
    pub commit_email: Option<String>,
    pub api_base: Option<String>,
}

/// Corpus source mirrors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Own direct list; derived from the GitHub settings when empty
    pub direct: Vec<String>,
    pub cn_domains: Vec<String>,
    pub cn_ips: Vec<String>,
    pub fetch_timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            direct: Vec::new(),
            cn_domains: vec![DEFAULT_CN_DOMAIN_URL.to_string()],
            cn_ips: DEFAULT_CN_IPV4_URLS.iter().map(|s| s.to_string()).collect(),
            fetch_timeout_secs: 60,
        }
    }
}

/// DoH classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DohConfig {
    pub a_servers: Vec<DohProvider>,
    pub ns_servers: Vec<DohProvider>,
    pub query_timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub deadline_ms: u64,
    pub domestic_ns_suffixes: Vec<String>,
    /// EDNS client subnet sent with address queries; empty or `none`
    /// disables it
    pub client_subnet: String,
}

impl Default for DohConfig {
    fn default() -> Self {
        let geo = GeoSettings::default();
        Self {
            a_servers: default_a_providers(),
            ns_servers: default_ns_providers(),
            query_timeout_ms: geo.query_timeout.as_millis() as u64,
            retries: geo.retries,
            retry_backoff_ms: geo.retry_backoff.as_millis() as u64,
            deadline_ms: geo.deadline.as_millis() as u64,
            domestic_ns_suffixes: DEFAULT_DOMESTIC_NS_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            client_subnet: DEFAULT_CLIENT_SUBNET.to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: GitHubConfig,
    pub sources: SourcesConfig,
    pub doh: DohConfig,
    /// Corpus refresh interval in seconds
    pub update_interval_secs: u64,
    /// On-disk corpus cache
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    /// TLDs that are direct by policy
    pub policy_tlds: Vec<String>,
    pub max_write_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            sources: SourcesConfig::default(),
            doh: DohConfig::default(),
            update_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            data_dir: None,
            log_level: "info".to_string(),
            policy_tlds: vec!["cn".to_string()],
            max_write_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load `path` (if given) and overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                log::debug!("Loaded configuration from {}", path.display());
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from an environment lookup. Empty values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = get("GITHUB_REPO") {
            self.github.repo = Some(v);
        }
        if let Some(v) = get("GITHUB_BRANCH") {
            self.github.branch = Some(v);
        }
        if let Some(v) = get("DIRECT_RULE_FILE") {
            self.github.rule_file = Some(v);
        }
        if let Some(v) = get("GITHUB_COMMIT_EMAIL") {
            self.github.commit_email = Some(v);
        }
        if let Some(v) = get("DOH_SERVERS") {
            self.doh.a_servers = parse_doh_servers(&v, default_a_providers());
        }
        if let Some(v) = get("NS_DOH_SERVERS") {
            self.doh.ns_servers = parse_doh_servers(&v, default_ns_providers());
        }
        if let Some(v) = get("DOH_CLIENT_SUBNET") {
            self.doh.client_subnet = v;
        }
        if let Some(v) = get("DATA_UPDATE_INTERVAL") {
            self.update_interval_secs = parse_update_interval(&v);
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_ascii_lowercase();
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }

    /// Corpus source mirrors.
    ///
    /// The direct list is normally read through the rule store; these URLs
    /// are its fallback. They default to the raw URL of the configured
    /// GitHub rule file, which only works for public repositories.
    pub fn source_urls(&self) -> SourceUrls {
        let direct = if !self.sources.direct.is_empty() {
            self.sources.direct.clone()
        } else {
            match (&self.github.repo, &self.github.rule_file) {
                (Some(repo), Some(file)) => vec![format!(
                    "https://raw.githubusercontent.com/{}/{}/{}",
                    repo,
                    self.github.branch.as_deref().unwrap_or("HEAD"),
                    file.trim_start_matches('/')
                )],
                _ => Vec::new(),
            }
        };
        SourceUrls {
            direct,
            cn_domains: self.sources.cn_domains.clone(),
            cn_ips: self.sources.cn_ips.clone(),
        }
    }

    /// EDNS client subnet for address queries, `None` when disabled.
    pub fn client_subnet(&self) -> Result<Option<IpNet>> {
        let value = self.doh.client_subnet.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        // A bare address is taken as its /24 (or /56 for IPv6)
        let net = match value.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => match value.parse::<std::net::IpAddr>() {
                Ok(addr @ std::net::IpAddr::V4(_)) => IpNet::new(addr, 24),
                Ok(addr) => IpNet::new(addr, 56),
                Err(_) => {
                    return Err(Error::Config(format!("invalid client subnet {:?}", value)))
                }
            }
            .map_err(|e| Error::Config(e.to_string()))?,
        };
        Ok(Some(net.trunc()))
    }

    pub fn geo_settings(&self) -> GeoSettings {
        GeoSettings {
            a_providers: self.doh.a_servers.clone(),
            ns_providers: self.doh.ns_servers.clone(),
            query_timeout: Duration::from_millis(self.doh.query_timeout_ms),
            retries: self.doh.retries,
            retry_backoff: Duration::from_millis(self.doh.retry_backoff_ms),
            deadline: Duration::from_millis(self.doh.deadline_ms),
            domestic_ns_suffixes: self.doh.domestic_ns_suffixes.clone(),
        }
    }

    /// Commit identity. The name is fixed; only the email is configurable.
    pub fn committer(&self) -> Committer {
        let mut committer = Committer::default();
        if let Some(email) = &self.github.commit_email {
            committer.email = email.clone();
        }
        committer
    }

    /// Token, repository and rule file path, all required for GitHub writes.
    pub fn github_target(&self) -> Result<(&str, &str, &str)> {
        let missing = |name: &str| Error::Config(format!("{} is not set", name));
        let token = self.github.token.as_deref().ok_or_else(|| missing("GITHUB_TOKEN"))?;
        let repo = self.github.repo.as_deref().ok_or_else(|| missing("GITHUB_REPO"))?;
        let file = self
            .github
            .rule_file
            .as_deref()
            .ok_or_else(|| missing("DIRECT_RULE_FILE"))?;
        Ok((token, repo, file))
    }
}

/// Parse `name=url,name=url` provider lists.
///
/// Entries without a name are called `server<N>`. Non-https URLs are
/// skipped. When nothing valid remains, `defaults` is returned.
pub fn parse_doh_servers(value: &str, defaults: Vec<DohProvider>) -> Vec<DohProvider> {
    let mut servers: Vec<DohProvider> = Vec::new();
    let parts = value.split(',').map(str::trim).filter(|p| !p.is_empty());
    for (index, part) in parts.enumerate() {
        let (name, url) = match part.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() => (name.trim().to_string(), url.trim()),
            Some((_, url)) => (format!("server{}", index + 1), url.trim()),
            None => (format!("server{}", index + 1), part),
        };
        if !url.starts_with("https://") {
            log::warn!("Ignoring DoH server {}: URL must use https://", url);
            continue;
        }
        // Later entries with the same name replace earlier ones
        servers.retain(|s| s.name != name);
        servers.push(DohProvider::new(name, url));
    }

    if servers.is_empty() {
        log::warn!("No valid DoH servers configured, using defaults");
        return defaults;
    }
    servers
}

/// Parse a positive number of seconds; anything else falls back to 6 hours.
pub fn parse_update_interval(value: &str) -> u64 {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => {
            log::warn!(
                "Invalid DATA_UPDATE_INTERVAL {:?}, using {}s",
                value,
                DEFAULT_REFRESH_INTERVAL.as_secs()
            );
            DEFAULT_REFRESH_INTERVAL.as_secs()
        }
    }
}
