//! LLM client seam.
//!
//! Used only by the optional discovery and escalation planners; the engine's
//! correctness never depends on a call succeeding. Provider implementations
//! live outside the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One structured LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// System prompt
    pub system: String,
    /// User prompt
    pub user: String,
    /// JSON schema the response must satisfy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    /// Model identifier; provider-specific
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Why the call is being made; logged and billed against
    pub reason: String,
}

/// LLM client for structured calls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Make one call and return the parsed JSON object.
    async fn call_llm(&self, request: LlmRequest) -> Result<Value>;

    /// Provider name, for logs.
    fn provider(&self) -> &str;
}

/// Client used when no provider is configured; every call fails cleanly and
/// callers degrade to their non-LLM paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn call_llm(&self, request: LlmRequest) -> Result<Value> {
        Err(Error::Llm {
            provider: "disabled".to_string(),
            message: format!("no llm provider configured (reason: {})", request.reason),
        })
    }

    fn provider(&self) -> &str {
        "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_llm_fails_cleanly() {
        let client = DisabledLlm;
        let err = client
            .call_llm(LlmRequest {
                system: "s".into(),
                user: "u".into(),
                json_schema: None,
                model: None,
                reason: "discovery".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm { .. }));
        assert!(!err.is_fatal());
    }
}
