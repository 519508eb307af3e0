//! GitHub contents API store.
//!
//! The revision token is the blob SHA GitHub returns for the file. A PUT
//! carrying a stale SHA is rejected by GitHub with 409 (or a 422 whose body
//! says the SHA does not match), which maps to [`StoreError::Conflict`].
//! Other 422 responses are validation failures and are not retried.
//!
//! Files over 1 MB come back without inline content (`encoding: none`); their
//! body is then fetched again with the raw media type.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{RuleFileRevision, RuleStore, WriteReceipt};
use crate::error::StoreError;

/// Public GitHub REST endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Commit author/committer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

impl Default for Committer {
    fn default() -> Self {
        Self {
            name: "Rule-Bot".to_string(),
            email: "noreply@users.noreply.github.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    message: &'a str,
    content: String,
    sha: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    committer: &'a Committer,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    content: UpdatedContent,
    #[serde(default)]
    commit: Option<CommitInfo>,
}

#[derive(Debug, Deserialize)]
struct UpdatedContent {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    #[serde(default)]
    html_url: Option<String>,
}

/// Rule file in a GitHub repository.
pub struct GitHubStore {
    client: reqwest::Client,
    api_base: String,
    token: String,
    /// `owner/name`
    repo: String,
    path: String,
    branch: Option<String>,
    committer: Committer,
}

impl GitHubStore {
    pub fn new(
        token: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            repo: repo.into(),
            path: path.into().trim_start_matches('/').to_string(),
            branch: None,
            committer: Committer::default(),
        })
    }

    /// Commit to `branch` instead of the repository default.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_committer(mut self, committer: Committer) -> Self {
        self.committer = committer;
        self
    }

    /// Use another API endpoint (GitHub Enterprise).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn contents_url(&self) -> String {
        format!("{}/repos/{}/contents/{}", self.api_base, self.repo, self.path)
    }

    fn get_contents(&self, accept: &'static str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(self.contents_url())
            .headers(self.headers(accept));
        if let Some(branch) = &self.branch {
            request = request.query(&[("ref", branch)]);
        }
        request
    }

    /// Body of a file too large for inline content.
    async fn fetch_raw(&self) -> Result<String, StoreError> {
        let response = self
            .get_contents(RAW_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        response
            .text()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn headers(&self, accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = format!("Bearer {}", self.token).parse() {
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = accept.parse() {
            headers.insert(ACCEPT, value);
        }
        if let Ok(value) = concat!("rulebot/", env!("CARGO_PKG_VERSION")).parse() {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = API_VERSION.parse() {
            headers.insert("x-github-api-version", value);
        }
        headers
    }

    /// Map a non-success response to a store error.
    async fn error_for(&self, response: Response) -> StoreError {
        let status = response.status();
        let rate_exhausted = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "0")
            .unwrap_or(false);
        let body = response.text().await.unwrap_or_default();
        classify_status(status, rate_exhausted, &self.path, body)
    }
}

/// Map GitHub status codes onto the store error taxonomy.
fn classify_status(status: StatusCode, rate_exhausted: bool, path: &str, body: String) -> StoreError {
    match status.as_u16() {
        404 => StoreError::NotFound(path.to_string()),
        409 => StoreError::Conflict,
        422 if is_sha_mismatch(&body) => StoreError::Conflict,
        422 => StoreError::Remote(format!("HTTP {}: {}", status, body)),
        429 => StoreError::RateLimited(body),
        403 if rate_exhausted => StoreError::RateLimited(body),
        401 | 403 => StoreError::Auth(format!("HTTP {}: {}", status, body)),
        _ => StoreError::Remote(format!("HTTP {}: {}", status, body)),
    }
}

/// Whether a 422 body reports a stale blob SHA.
fn is_sha_mismatch(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("does not match")
}

#[async_trait]
impl RuleStore for GitHubStore {
    async fn fetch(&self) -> Result<RuleFileRevision, StoreError> {
        let response = self
            .get_contents(JSON_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }

        let contents: ContentsResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let content = if contents.encoding == "none" {
            log::debug!("{} is too large for inline content, fetching raw", self.describe());
            self.fetch_raw().await?
        } else {
            decode_content(&contents)?
        };
        log::debug!("Fetched {} at {}", self.describe(), contents.sha);
        Ok(RuleFileRevision {
            content,
            token: contents.sha,
        })
    }

    async fn write(
        &self,
        base: &RuleFileRevision,
        content: &str,
        message: &str,
    ) -> Result<WriteReceipt, StoreError> {
        let body = UpdateRequest {
            message,
            content: BASE64.encode(content.as_bytes()),
            sha: &base.token,
            branch: self.branch.as_deref(),
            committer: &self.committer,
        };

        let response = self
            .client
            .put(self.contents_url())
            .headers(self.headers(JSON_MEDIA_TYPE))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }

        let updated: UpdateResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(WriteReceipt {
            commit_url: updated.commit.and_then(|c| c.html_url),
            token: updated.content.sha,
        })
    }

    fn describe(&self) -> String {
        match &self.branch {
            Some(branch) => format!("github:{}/{}@{}", self.repo, self.path, branch),
            None => format!("github:{}/{}", self.repo, self.path),
        }
    }
}

/// Decode the base64 body GitHub returns (wrapped at 60 columns).
fn decode_content(contents: &ContentsResponse) -> Result<String, StoreError> {
    if !contents.encoding.is_empty() && contents.encoding != "base64" {
        return Err(StoreError::Decode(format!(
            "unsupported content encoding {}",
            contents.encoding
        )));
    }
    let compact: String = contents
        .content
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let map = |code: u16, exhausted: bool| {
            classify_status(StatusCode::from_u16(code).unwrap(), exhausted, "rules.list", String::new())
        };
        assert!(matches!(map(404, false), StoreError::NotFound(_)));
        assert!(matches!(map(409, false), StoreError::Conflict));
        assert!(matches!(map(422, false), StoreError::Remote(_)));
        assert!(matches!(map(401, false), StoreError::Auth(_)));
        assert!(matches!(map(403, false), StoreError::Auth(_)));
        assert!(matches!(map(403, true), StoreError::RateLimited(_)));
        assert!(matches!(map(429, false), StoreError::RateLimited(_)));
        assert!(matches!(map(502, false), StoreError::Remote(_)));
    }

    #[test]
    fn test_422_is_conflict_only_for_stale_sha() {
        let map = |body: &str| {
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, false, "rules.list", body.to_string())
        };
        assert!(matches!(
            map(r#"{"message":"rules.list does not match 3d21ec53a331a6f037a91c368710b99387d012c1"}"#),
            StoreError::Conflict
        ));
        assert!(matches!(
            map(r#"{"message":"Invalid request.\n\n\"sha\" wasn't supplied."}"#),
            StoreError::Remote(_)
        ));
        assert!(matches!(
            map(r#"{"message":"Branch nope not found"}"#),
            StoreError::Remote(_)
        ));
    }

    #[test]
    fn test_large_file_has_no_inline_content() {
        let contents: ContentsResponse = serde_json::from_str(
            r#"{"sha":"abc","content":"","encoding":"none","size":2000000}"#,
        )
        .unwrap();
        assert_eq!(contents.encoding, "none");
        // Inline decoding refuses it; fetch() switches to the raw media type
        assert!(decode_content(&contents).is_err());
    }

    #[test]
    fn test_decode_wrapped_content() {
        let text = "DOMAIN-SUFFIX,example.com,direct\n";
        let encoded = BASE64.encode(text);
        let (head, tail) = encoded.split_at(10);
        let contents = ContentsResponse {
            sha: "abc".into(),
            content: format!("{}\n{}\n", head, tail),
            encoding: "base64".into(),
        };
        assert_eq!(decode_content(&contents).unwrap(), text);
    }

    #[test]
    fn test_update_request_shape() {
        let committer = Committer::default();
        let body = UpdateRequest {
            message: "Add example.com to direct rules",
            content: BASE64.encode("x"),
            sha: "abc123",
            branch: None,
            committer: &committer,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["sha"], "abc123");
        assert_eq!(json["committer"]["name"], "Rule-Bot");
        assert!(json.get("branch").is_none());
    }

    #[test]
    fn test_describe() {
        let store = GitHubStore::new("t", "owner/rules", "/rule/direct.list")
            .unwrap()
            .with_branch("main");
        assert_eq!(store.describe(), "github:owner/rules/rule/direct.list@main");
        assert_eq!(
            store.contents_url(),
            "https://api.github.com/repos/owner/rules/contents/rule/direct.list"
        );
    }
}
