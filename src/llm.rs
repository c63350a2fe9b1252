//! Language-model collaborator: a narrow async interface plus the shared
//! retry policy.
//!
//! The core never knows which provider or model sits behind the trait;
//! per-task selection keys are pass-through configuration for the host.
//! [`ScriptedModel`] is the deterministic stub used by the test suite and
//! by anyone who wants a reproducible pipeline run.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Budget for a single language-model call.
#[derive(Debug, Clone, Copy)]
pub struct LlmBudget {
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Wall-clock limit for the call.
    pub timeout: Duration,
}

impl Default for LlmBudget {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }
}

impl LlmBudget {
    /// Budget with the given timeout and the default token bound.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Narrow language-model interface consumed by the pipeline.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// JSON-validated single response conforming to `schema`.
    async fn structured(&self, prompt: &str, schema: &Value, budget: &LlmBudget) -> Result<Value>;

    /// Free-form text response.
    async fn complete(&self, prompt: &str, budget: &LlmBudget) -> Result<String>;
}

/// Call `structured` with the pipeline's retry policy: one retry with
/// exponential backoff on transient or schema failures, wrapped in the
/// budget's timeout. Input errors and cancellation are never retried.
pub async fn structured_with_retry(
    llm: &dyn LanguageModel,
    prompt: &str,
    schema: &Value,
    budget: &LlmBudget,
) -> Result<Value> {
    let mut backoff = Duration::from_millis(250);
    let mut last_err = None;
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
        let call = llm.structured(prompt, schema, budget);
        match tokio::time::timeout(budget.timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => last_err = Some(e),
            Ok(Err(e)) => return Err(e),
            Err(_) => last_err = Some(Error::transient("language-model call timed out")),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::transient("language-model call failed")))
}

enum Scripted {
    Value(Value),
    Error(fn(String) -> Error, String),
}

/// Deterministic scripted model for tests and reproducible runs.
///
/// Responses are registered against a key substring; the first registered
/// key found in the prompt wins, and its queued responses are consumed in
/// order (the last one repeats). Prompts with no matching key get the
/// default response, or a schema error if none was set.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    default: Option<Value>,
}

impl ScriptedModel {
    /// Create a model with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a response for prompts containing `key`. Repeated
    /// registrations for the same key are consumed in order; the last one
    /// repeats forever.
    #[must_use]
    pub fn with_response(self, key: &str, value: Value) -> Self {
        self.push(key, Scripted::Value(value));
        self
    }

    /// Register a transient failure for prompts containing `key`.
    #[must_use]
    pub fn with_transient_failure(self, key: &str) -> Self {
        self.push(key, Scripted::Error(Error::Transient, "scripted failure".into()));
        self
    }

    fn push(&self, key: &str, entry: Scripted) {
        let mut scripts = self.scripts.lock().expect("script lock");
        match scripts.iter_mut().find(|(k, _)| k == key) {
            Some((_, queue)) => queue.push_back(entry),
            None => {
                let mut queue = VecDeque::new();
                queue.push_back(entry);
                scripts.push((key.to_string(), queue));
            }
        }
    }

    /// Set the response for prompts matching no registered key.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn answer(&self, prompt: &str) -> Result<Value> {
        let mut scripts = self.scripts.lock().expect("script lock");
        for (key, queue) in scripts.iter_mut() {
            if !prompt.contains(key.as_str()) {
                continue;
            }
            let entry = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().map(|e| match e {
                    Scripted::Value(v) => Scripted::Value(v.clone()),
                    Scripted::Error(make, msg) => Scripted::Error(*make, msg.clone()),
                })
            };
            if let Some(entry) = entry {
                return match entry {
                    Scripted::Value(v) => Ok(v),
                    Scripted::Error(make, msg) => Err(make(msg)),
                };
            }
        }
        match &self.default {
            Some(v) => Ok(v.clone()),
            None => Err(Error::schema(format!(
                "no scripted response for prompt: {}",
                prompt.chars().take(80).collect::<String>()
            ))),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn structured(&self, prompt: &str, _schema: &Value, _budget: &LlmBudget) -> Result<Value> {
        self.answer(prompt)
    }

    async fn complete(&self, prompt: &str, _budget: &LlmBudget) -> Result<String> {
        self.answer(prompt).map(|v| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_key_matching() {
        let llm = ScriptedModel::new()
            .with_response("classify", json!({"document_type": "Complaint"}))
            .with_default(json!({}));

        let budget = LlmBudget::default();
        let out = llm
            .structured("please classify this", &json!({}), &budget)
            .await
            .unwrap();
        assert_eq!(out["document_type"], "Complaint");

        let fallback = llm.structured("other", &json!({}), &budget).await.unwrap();
        assert_eq!(fallback, json!({}));
    }

    #[tokio::test]
    async fn unscripted_prompt_is_schema_error() {
        let llm = ScriptedModel::new();
        let err = llm
            .structured("anything", &json!({}), &LlmBudget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[tokio::test]
    async fn retry_consumes_queued_responses() {
        // First response is a failure, second succeeds; the retry helper
        // should surface the success.
        let llm = ScriptedModel::new().with_transient_failure("flaky");
        let llm = llm.with_response("flaky", json!({"ok": true}));

        let budget = LlmBudget::with_timeout(Duration::from_secs(5));
        let out = structured_with_retry(&llm, "a flaky prompt", &serde_json::json!({}), &budget)
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
    }

    #[tokio::test]
    async fn retry_gives_up_after_second_failure() {
        struct AlwaysFails;
        #[async_trait]
        impl LanguageModel for AlwaysFails {
            async fn structured(&self, _: &str, _: &Value, _: &LlmBudget) -> Result<Value> {
                Err(Error::transient("down"))
            }
            async fn complete(&self, _: &str, _: &LlmBudget) -> Result<String> {
                Err(Error::transient("down"))
            }
        }
        let err = structured_with_retry(
            &AlwaysFails,
            "prompt",
            &serde_json::json!({}),
            &LlmBudget::with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }
}
