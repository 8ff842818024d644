//! Error types for harvest-core.

use thiserror::Error;

/// Result type alias using harvest-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a harvest run.
#[derive(Error, Debug)]
pub enum Error {
    /// Compiled rule bundle is missing or its version does not match
    #[error("rules not compiled for category '{category}': {reason}")]
    RulesNotCompiled { category: String, reason: String },

    /// Identity lock is below the minimum required for planning
    #[error("identity insufficient: {0}")]
    IdentityInsufficient(String),

    /// A job was submitted without a category
    #[error("category required")]
    CategoryRequired,

    /// Fetch-layer failure for a single URL
    #[error("fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Per-fetch deadline exceeded
    #[error("fetch timed out for {url} after {timeout_ms}ms")]
    FetchTimeout { url: String, timeout_ms: u64 },

    /// Durable store (frontier, learning, review) failure
    #[error("store error: {0}")]
    Store(String),

    /// Blob/artifact storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM provider error; never correctness-critical
    #[error("llm error: {provider} - {message}")]
    Llm { provider: String, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a `RulesNotCompiled` error.
    pub fn rules_not_compiled(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RulesNotCompiled {
            category: category.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error for a URL.
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a store error.
    pub fn store(message: impl std::fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Create a storage error.
    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(message.to_string())
    }

    /// True when the error is fatal to the whole run rather than to one
    /// source or candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RulesNotCompiled { .. }
                | Self::IdentityInsufficient(_)
                | Self::CategoryRequired
                | Self::Storage(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
