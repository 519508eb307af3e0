//! Error types for rulebot.

use std::time::Duration;

use thiserror::Error;

/// Error type for rulebot operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No domain could be extracted from the input text
    #[error(transparent)]
    NotFound(#[from] NotFound),

    /// A rule source could not be fetched or parsed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The hosted rule file could not be updated
    #[error(transparent)]
    Write(#[from] WriteError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for rulebot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// No plausible domain was found in the input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no domain found in input")]
pub struct NotFound;

/// Error fetching a rule corpus source.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport-level failure
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// Non-success HTTP status
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// Every mirror of a source failed
    #[error("all mirrors failed for {source_name}")]
    AllMirrorsFailed { source_name: String },

    /// Source fetched but yielded no usable entries
    #[error("{source_name} contained no usable entries")]
    Empty { source_name: String },

    /// A refresh is already in progress
    #[error("refresh already in progress")]
    Busy,

    /// Local cache IO error
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error querying a DoH provider.
#[derive(Error, Debug)]
pub enum DohError {
    /// Query could not be encoded
    #[error("failed to encode query for {0}")]
    Encode(String),

    /// Transport-level failure
    #[error("DoH request to {provider} failed: {reason}")]
    Http { provider: String, reason: String },

    /// Provider answered with a non-success HTTP status
    #[error("DoH provider {provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },

    /// Response body was not a valid DNS message
    #[error("invalid DNS response from {provider}: {reason}")]
    Decode { provider: String, reason: String },

    /// Provider did not answer in time
    #[error("DoH provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },
}

/// Error from a hosted rule store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Rule file does not exist at the configured path
    #[error("rule file not found: {0}")]
    NotFound(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Revision token no longer matches the remote file
    #[error("revision conflict")]
    Conflict,

    /// Remote refused because of rate limiting
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport or unexpected remote failure
    #[error("remote error: {0}")]
    Remote(String),

    /// Remote payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Local file IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal failure of a single append request.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Rule file missing
    #[error("rule file not found: {0}")]
    NotFound(String),

    /// Credentials rejected
    #[error("not authorized to update the rule file: {0}")]
    Unauthorized(String),

    /// Remote is rate limiting us
    #[error("rate limited by the rule host: {0}")]
    RateLimited(String),

    /// Anything else
    #[error("failed to update the rule file: {0}")]
    Remote(String),
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => WriteError::NotFound(path),
            StoreError::Auth(msg) => WriteError::Unauthorized(msg),
            StoreError::RateLimited(msg) => WriteError::RateLimited(msg),
            other => WriteError::Remote(other.to_string()),
        }
    }
}
