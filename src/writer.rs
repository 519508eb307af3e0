//! Appending direct rules to the hosted rule file.
//!
//! Each append is an optimistic read-modify-write: read the file and its
//! revision token, add one line, write conditioned on the token. A stale
//! token means someone else changed the file; the cycle starts over from a
//! fresh read, up to a bounded number of attempts.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{suffixes_of, Domain};
use crate::error::{StoreError, WriteError};
use crate::rules::{parse_line, RuleKind};
use crate::store::RuleStore;

/// Default number of read-modify-write cycles per append.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of an append that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The file now covers the domain
    Committed {
        commit_url: Option<String>,
        /// Already covered; nothing was written
        duplicate: bool,
    },
    /// Every attempt lost a race with another writer
    Conflict { attempts: u32 },
}

/// Appends `DOMAIN-SUFFIX` rules to a [`RuleStore`].
pub struct RemoteRuleWriter {
    store: Arc<dyn RuleStore>,
    /// Serializes appends from this process
    lock: Mutex<()>,
    max_attempts: u32,
}

impl RemoteRuleWriter {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the number of read-modify-write cycles. At least one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Append a direct rule for `domain`.
    pub async fn append_rule(&self, domain: &Domain) -> Result<AppendOutcome, WriteError> {
        self.append_rule_as(domain, None).await
    }

    /// Append a direct rule, crediting `requested_by` in the commit message.
    pub async fn append_rule_as(
        &self,
        domain: &Domain,
        requested_by: Option<&str>,
    ) -> Result<AppendOutcome, WriteError> {
        let _guard = self.lock.lock().await;
        let message = commit_message(domain, requested_by);

        for attempt in 1..=self.max_attempts {
            let revision = self.store.fetch().await?;

            if let Some(rule) = covering_rule(&revision.content, domain) {
                log::info!(
                    "{} already covered by {} in {}",
                    domain,
                    rule,
                    self.store.describe()
                );
                return Ok(AppendOutcome::Committed {
                    commit_url: None,
                    duplicate: true,
                });
            }

            let updated = insert_rule(&revision.content, &render_rule(&revision.content, domain));
            match self.store.write(&revision, &updated, &message).await {
                Ok(receipt) => {
                    log::info!(
                        "Added {} to {} (revision {})",
                        domain,
                        self.store.describe(),
                        receipt.token
                    );
                    return Ok(AppendOutcome::Committed {
                        commit_url: receipt.commit_url,
                        duplicate: false,
                    });
                }
                Err(StoreError::Conflict) => {
                    log::warn!(
                        "{} changed while adding {} (attempt {}/{}), retrying",
                        self.store.describe(),
                        domain,
                        attempt,
                        self.max_attempts
                    );
                }
                Err(e) => {
                    log::error!("Failed to add {}: {}", domain, e);
                    return Err(e.into());
                }
            }
        }

        log::warn!(
            "Giving up on {} after {} conflicting attempts",
            domain,
            self.max_attempts
        );
        Ok(AppendOutcome::Conflict {
            attempts: self.max_attempts,
        })
    }
}

/// Commit message for an append.
pub fn commit_message(domain: &Domain, requested_by: Option<&str>) -> String {
    match requested_by.map(|u| u.trim_start_matches('@')).filter(|u| !u.is_empty()) {
        Some(user) => format!("Add {} to direct rules (requested by @{})", domain, user),
        None => format!("Add {} to direct rules", domain),
    }
}

/// The existing suffix (or exact) rule value that already covers `domain`.
fn covering_rule(content: &str, domain: &Domain) -> Option<String> {
    content
        .lines()
        .filter_map(parse_line)
        .map(|parsed| parsed.entry)
        .find(|entry| match entry.kind {
            RuleKind::Suffix => suffixes_of(domain.as_str()).any(|s| s == entry.value),
            RuleKind::Exact => entry.value == domain.as_str(),
            _ => false,
        })
        .map(|entry| entry.value)
}

/// Render a rule line for `domain` in the style of the file's last suffix
/// rule. Without one, a rule-provider payload item when the file has a
/// `payload:` header, else `DOMAIN-SUFFIX,<domain>,direct`.
fn render_rule(content: &str, domain: &Domain) -> String {
    let template = content.lines().rev().find_map(|raw| {
        let raw = raw.trim_end_matches('\r');
        let parsed = parse_line(raw)?;
        (parsed.entry.kind == RuleKind::Suffix).then_some((raw, parsed))
    });

    match template {
        Some((raw, parsed)) => format!(
            "{}{}{}{}",
            &raw[..parsed.content.start],
            &raw[parsed.content.start..parsed.value.start],
            domain,
            &raw[parsed.value.end..parsed.content.end]
        ),
        None if content.lines().any(|l| l.trim_end() == "payload:") => {
            format!("  - DOMAIN-SUFFIX,{}", domain)
        }
        None => format!("DOMAIN-SUFFIX,{},direct", domain),
    }
}

/// Insert `line` after the last rule line (or at the end of a file without
/// rules), keeping trailing comments and blank lines at the end.
///
/// Every existing byte is kept. The new line takes the line ending of the
/// line it follows, and a file without a final newline stays without one.
fn insert_rule(content: &str, line: &str) -> String {
    let mut offset = 0;
    let mut last_eol = "\n";
    let mut anchor = None;
    for raw in content.split_inclusive('\n') {
        offset += raw.len();
        if raw.ends_with("\r\n") {
            last_eol = "\r\n";
        } else if raw.ends_with('\n') {
            last_eol = "\n";
        }
        if parse_line(raw.trim_end_matches('\n')).is_some() {
            anchor = Some((offset, last_eol));
        }
    }

    let (at, eol) = anchor.unwrap_or((content.len(), last_eol));
    let (before, after) = content.split_at(at);
    let mut out = String::with_capacity(content.len() + line.len() + eol.len());
    out.push_str(before);
    if before.is_empty() || before.ends_with('\n') {
        out.push_str(line);
        out.push_str(eol);
    } else {
        // Unterminated last line
        out.push_str(eol);
        out.push_str(line);
    }
    out.push_str(after);
    out
}
