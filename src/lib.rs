//! rulebot - decides whether a domain should be routed direct and appends
//! accepted domains to a hosted Clash rule file.
//!
//! A request goes through these steps:
//!
//! 1. **Normalize**: extract the registrable domain from free text
//!    (`check https://a.b.example.co.uk/x` → `example.co.uk`)
//! 2. **Membership**: look the domain up in the cached rule corpus (the
//!    project's own direct list plus the public CN lists); no network
//! 3. **Classify**: DoH A and NS polls across several providers, decided by
//!    quorum
//! 4. **Recommend**: already direct, direct by policy, add, reject or
//!    undetermined
//! 5. **Append**: optimistic read-modify-write of the hosted rule file
//!
//! # Quick Start
//!
//! ```ignore
//! use rulebot::{Config, RuleService, Recommendation};
//! use std::sync::Arc;
//!
//! let config = Config::load(None)?;
//! let store = Arc::new(RuleService::github_store(&config)?);
//! let service = RuleService::from_config(&config, store)?;
//!
//! service.init().await;
//! let _refresh = service.cache().clone().spawn_refresh_loop();
//!
//! let rec = service.decide("please add https://www.example.com.cn").await?;
//! if let Recommendation::AddDirect { domain, .. } = &rec {
//!     service.append_rule(domain, Some("alice")).await?;
//! }
//! ```
//!
//! # Rule Sources
//!
//! - Own direct list: Clash classical lines such as
//!   `DOMAIN-SUFFIX,example.com,direct`
//! - CN domain list: geosite text (`full:`, `domain:`, `keyword:`,
//!   `regexp:`)
//! - CN IP list: one CIDR per line
//!
//! The corpus is refreshed in the background and swapped atomically.
//! A failed refresh keeps the previous snapshot.

mod error;
mod metadata;

pub mod cache;
pub mod config;
pub mod corpus;
pub mod decision;
pub mod doh;
pub mod domain;
pub mod geo;
pub mod rules;
pub mod service;
pub mod store;
pub mod writer;

// Re-export core types
pub use error::{DohError, Error, FetchError, NotFound, Result, StoreError, WriteError};
pub use metadata::UpdateMetadata;

pub use cache::{CorpusView, Fetcher, HttpFetcher, RuleSetCache, SourceUrls};
pub use config::Config;
pub use corpus::{Coverage, RuleCorpus};
pub use decision::{DecisionEngine, Lookup, Recommendation};
pub use doh::{DnsTransport, DohProvider, HttpDohTransport, QueryKind, Resolution};
pub use domain::{normalize, normalize_with_fallback, strip_mention, Domain};
pub use geo::{combine, Classify, GeoClassifier, GeoSettings, GeoVerdict, Tally, Verdict};
pub use service::RuleService;
pub use store::{FileStore, GitHubStore, RuleFileRevision, RuleStore, WriteReceipt};
pub use writer::{AppendOutcome, RemoteRuleWriter};
