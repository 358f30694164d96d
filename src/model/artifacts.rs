//! On-disk artifact cache and the model-hub download boundary.
//!
//! Files live at `<root>/models--<org>--<name>/<revision>/<file>`. Every
//! download lands in its own `.partial` temp file next to the target and is
//! renamed into place, so a reader only ever sees complete files and racing
//! writers (threads or processes) each install an identical copy.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info};

use crate::{error::ServiceError, model::types::ModelIdentity};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `filename` of `identity` into `dest`. A file the registry does
    /// not have must be reported as [`ServiceError::ArtifactMissing`].
    async fn fetch(
        &self,
        identity: &ModelIdentity,
        filename: &str,
        dest: &Path,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, identity: &ModelIdentity, filename: &str) -> Result<PathBuf, ServiceError> {
        if filename.is_empty()
            || filename.starts_with('/')
            || filename.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(ServiceError::Config(format!("invalid artifact name `{filename}`")));
        }
        Ok(self
            .root
            .join(identity.cache_dir_name())
            .join(identity.revision())
            .join(filename))
    }

    /// Cached copy of `filename`, if a non-empty one exists.
    pub fn lookup(&self, identity: &ModelIdentity, filename: &str) -> Option<PathBuf> {
        let path = self.path_for(identity, filename).ok()?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    pub async fn resolve(
        &self,
        fetcher: &dyn ArtifactFetcher,
        identity: &ModelIdentity,
        filename: &str,
    ) -> Result<PathBuf, ServiceError> {
        if let Some(path) = self.lookup(identity, filename) {
            debug!(%identity, filename, "artifact cache hit");
            return Ok(path);
        }

        let path = self.path_for(identity, filename)?;
        let entry_dir = path
            .parent()
            .ok_or_else(|| ServiceError::Config(format!("invalid artifact name `{filename}`")))?;
        fs::create_dir_all(entry_dir)?;

        // Dropped (and deleted) on any early return below.
        let base = filename.rsplit('/').next().unwrap_or(filename);
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{base}."))
            .suffix(".partial")
            .tempfile_in(entry_dir)?;

        info!(%identity, filename, "fetching artifact");
        fetcher.fetch(identity, filename, partial.path()).await?;

        if let Err(err) = partial.persist(&path) {
            if let Some(existing) = self.lookup(identity, filename) {
                debug!(%identity, filename, error = %err.error, "artifact installed by a concurrent fetch");
                return Ok(existing);
            }
            return Err(err.error.into());
        }
        info!(%identity, filename, path = %path.display(), "artifact cached");

        Ok(path)
    }

    /// Like [`resolve`](Self::resolve), but a file the registry does not have
    /// yields `None` instead of an error.
    pub async fn resolve_optional(
        &self,
        fetcher: &dyn ArtifactFetcher,
        identity: &ModelIdentity,
        filename: &str,
    ) -> Result<Option<PathBuf>, ServiceError> {
        match self.resolve(fetcher, identity, filename).await {
            Ok(path) => Ok(Some(path)),
            Err(ServiceError::ArtifactMissing(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Every file one checkpoint needs, resolved to local paths.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub tokenizer: PathBuf,
    pub model_config: Option<PathBuf>,
    pub weights: PathBuf,
}

impl ModelArtifacts {
    pub async fn resolve(
        cache: &ArtifactCache,
        fetcher: &dyn ArtifactFetcher,
        identity: &ModelIdentity,
        weights_file: &str,
    ) -> Result<Self, ServiceError> {
        let tokenizer = cache.resolve(fetcher, identity, TOKENIZER_FILE).await?;
        let model_config = cache
            .resolve_optional(fetcher, identity, MODEL_CONFIG_FILE)
            .await?;
        let weights = cache.resolve(fetcher, identity, weights_file).await?;
        Ok(Self {
            tokenizer,
            model_config,
            weights,
        })
    }
}

/// Facts read from a checkpoint's `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelConfigHints {
    pub eos_token_id: Option<u32>,
    pub max_context_tokens: Option<usize>,
}

impl ModelConfigHints {
    pub fn load(path: Option<&Path>) -> Result<Self, ServiceError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Backend(format!("invalid {MODEL_CONFIG_FILE}: {e}")))?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        // Some checkpoints list several end tokens; the first one is used.
        let eos_token_id = match value.get("eos_token_id") {
            Some(Value::Array(ids)) => ids.first().and_then(Value::as_u64),
            Some(other) => other.as_u64(),
            None => None,
        }
        .and_then(|id| u32::try_from(id).ok());

        let max_context_tokens = ["max_position_embeddings", "n_positions", "max_seq_len", "seq_length"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_u64))
            .and_then(|n| usize::try_from(n).ok());

        Self {
            eos_token_id,
            max_context_tokens,
        }
    }
}

/// Downloads artifacts from a Hugging Face compatible hub.
pub struct HubFetcher {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubFetcher {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Fetch(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn download_url(&self, identity: &ModelIdentity, filename: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            identity.repo_id(),
            identity.revision(),
            filename
        )
    }
}

#[async_trait]
impl ArtifactFetcher for HubFetcher {
    async fn fetch(
        &self,
        identity: &ModelIdentity,
        filename: &str,
        dest: &Path,
    ) -> Result<(), ServiceError> {
        let url = self.download_url(identity, filename);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| ServiceError::Fetch(format!("{url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ServiceError::ArtifactMissing(format!("{identity}/{filename}")));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ServiceError::Fetch(format!(
                "{url}: {status} (gated or private model; set HF_TOKEN)"
            )));
        }
        if !status.is_success() {
            return Err(ServiceError::Fetch(format!("{url}: {status}")));
        }

        let expected = response.content_length();
        let mut file = File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ServiceError::Fetch(format!("{url}: {e}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(ServiceError::Fetch(format!(
                    "{url}: incomplete download ({written} of {expected} bytes)"
                )));
            }
        }

        debug!(%identity, filename, bytes = written, "download complete");
        Ok(())
    }
}
