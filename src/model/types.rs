use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

pub const DEFAULT_REVISION: &str = "main";

/// Hub repository id plus revision naming one pretrained checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentity {
    repo_id: String,
    revision: String,
}

impl ModelIdentity {
    pub fn parse(repo_id: &str) -> Result<Self, ServiceError> {
        Self::with_revision(repo_id, DEFAULT_REVISION)
    }

    pub fn with_revision(repo_id: &str, revision: &str) -> Result<Self, ServiceError> {
        let repo_id = repo_id.trim();
        let revision = revision.trim();
        if repo_id.is_empty() {
            return Err(ServiceError::Config("model id must not be empty".into()));
        }
        if repo_id.starts_with('/')
            || repo_id.split('/').any(|part| part.is_empty() || part == "..")
            || repo_id.chars().any(char::is_whitespace)
        {
            return Err(ServiceError::Config(format!("invalid model id `{repo_id}`")));
        }
        if revision.is_empty() || revision.contains("..") || revision.contains('/') {
            return Err(ServiceError::Config(format!("invalid model revision `{revision}`")));
        }
        Ok(Self {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Directory name used for this checkpoint inside the artifact cache.
    pub fn cache_dir_name(&self) -> String {
        format!("models--{}", self.repo_id.replace('/', "--"))
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo_id, self.revision)
    }
}

/// Prompt text that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    pub fn new(text: impl Into<String>) -> Result<Self, ServiceError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ServiceError::BadRequest("prompt must not be empty".into()));
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

impl CompletionRequest {
    pub fn into_prompt(self) -> Result<Prompt, ServiceError> {
        let prompt = self
            .prompt
            .ok_or_else(|| ServiceError::BadRequest("missing field `prompt`".into()))?;
        Prompt::new(prompt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionResponse {
    pub completion: String,
}

impl From<Completion> for CompletionResponse {
    fn from(completion: Completion) -> Self {
        Self {
            completion: completion.text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-sequence token.
    Eos,
    /// The new-token budget ran out first.
    MaxTokens,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub elapsed: Duration,
}

impl Completion {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens_generated as f64 / secs
        } else {
            self.tokens_generated as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub revision: String,
    pub device: String,
    pub dtype: String,
    pub size_bytes: u64,
    pub max_context_tokens: Option<usize>,
    pub eos_token_id: Option<u32>,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub do_sample: bool,
}
