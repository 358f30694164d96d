//! Caller side of the completion endpoint.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::ServiceError, model::CompletionResponse};

/// Outcome of one remote completion. Exactly one of `output` and `error` is
/// set; `duration_ms` is only reported for successful calls.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionOutcome {
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u128>,
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    prompt: &'a str,
}

pub struct CompletionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl CompletionClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// Joins a system prompt and an input prompt the way the endpoint
    /// expects a single prompt string.
    pub fn compose_prompt(system_prompt: &str, input_prompt: &str) -> String {
        format!("{system_prompt}\n\n{input_prompt}")
    }

    pub async fn complete(&self, prompt: &str) -> CompletionOutcome {
        let start = Instant::now();
        match self.request(prompt).await {
            Ok(output) => {
                let duration_ms = start.elapsed().as_millis();
                debug!(duration_ms = duration_ms as u64, "remote completion finished");
                CompletionOutcome {
                    output: Some(output),
                    error: None,
                    duration_ms: Some(duration_ms),
                }
            }
            Err(error) => {
                warn!(%error, "remote completion failed");
                CompletionOutcome {
                    output: None,
                    error: Some(error),
                    duration_ms: None,
                }
            }
        }
    }

    async fn request(&self, prompt: &str) -> Result<String, String> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&CompletionPayload { prompt })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(format!("{status}: {message}"));
        }

        let body: CompletionResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(body.completion)
    }
}
