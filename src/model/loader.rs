use std::{fs, sync::Arc};

use tokenizers::Tokenizer;
use tokio::task;
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    model::{
        ModelServer,
        artifacts::{ArtifactCache, ArtifactFetcher, ModelArtifacts, ModelConfigHints},
        backend::ModelLoader,
        placement::Placement,
        sampling::GenerationConfig,
        types::{ModelIdentity, ModelMetadata},
    },
};

/// End-of-sequence spellings probed when neither the deployment nor the
/// checkpoint config names one.
const WELL_KNOWN_EOS_TOKENS: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

pub const DEFAULT_WEIGHTS_FILE: &str = "model.ts";

#[derive(Debug, Clone)]
pub struct ModelServerConfig {
    pub identity: ModelIdentity,
    pub weights_file: String,
    pub placement: Placement,
    pub generation: GenerationConfig,
    /// Overrides the context length read from the checkpoint config.
    pub max_context_tokens: Option<usize>,
    /// Overrides the end-of-sequence token read from the checkpoint config.
    pub eos_token: Option<String>,
    pub trust_remote_code: bool,
}

impl ModelServerConfig {
    pub fn new(identity: ModelIdentity) -> Self {
        Self {
            identity,
            weights_file: DEFAULT_WEIGHTS_FILE.to_string(),
            placement: Placement::default(),
            generation: GenerationConfig::default(),
            max_context_tokens: None,
            eos_token: None,
            trust_remote_code: true,
        }
    }
}

/// A model server that has not been loaded yet. [`initialize`](Self::initialize)
/// consumes it and yields a ready [`ModelServer`] or the startup error.
pub struct ModelServerBuilder {
    config: ModelServerConfig,
    cache: ArtifactCache,
    fetcher: Arc<dyn ArtifactFetcher>,
    loader: Arc<dyn ModelLoader>,
}

impl ModelServerBuilder {
    pub fn new(
        config: ModelServerConfig,
        cache: ArtifactCache,
        fetcher: Arc<dyn ArtifactFetcher>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            loader,
        }
    }

    pub async fn initialize(self) -> Result<ModelServer, ServiceError> {
        let identity = self.config.identity.clone();
        self.load()
            .await
            .map_err(|err| ServiceError::startup(&identity, err))
    }

    async fn load(self) -> Result<ModelServer, ServiceError> {
        let Self {
            config,
            cache,
            fetcher,
            loader,
        } = self;
        config.generation.validate()?;

        info!(
            identity = %config.identity,
            cache = %cache.root().display(),
            device = %config.placement.device,
            dtype = config.placement.precision.as_str(),
            "initializing model server"
        );

        let artifacts =
            ModelArtifacts::resolve(&cache, fetcher.as_ref(), &config.identity, &config.weights_file)
                .await?;

        let tokenizer_path = artifacts.tokenizer.clone();
        let tokenizer = task::spawn_blocking(move || Tokenizer::from_file(&tokenizer_path))
            .await
            .map_err(|err| ServiceError::Other(format!("tokenizer load task failed: {err}")))?
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let hints = ModelConfigHints::load(artifacts.model_config.as_deref())?;
        let eos_token_id = resolve_eos(&tokenizer, config.eos_token.as_deref(), &hints)?;
        if eos_token_id.is_none() {
            warn!(identity = %config.identity, "no end-of-sequence token; generation stops only at the token cap");
        }
        let max_context_tokens = config.max_context_tokens.or(hints.max_context_tokens);

        let weights = artifacts.weights.clone();
        let size_bytes = fs::metadata(&weights)?.len();
        let placement = config.placement;
        let trust_remote_code = config.trust_remote_code;
        let loaded = task::spawn_blocking(move || {
            loader.load(&weights, &placement, trust_remote_code)
        })
        .await
        .map_err(|err| ServiceError::Other(format!("model load task failed: {err}")))??;

        let metadata = ModelMetadata {
            model_id: config.identity.repo_id().to_string(),
            revision: config.identity.revision().to_string(),
            device: loaded.device,
            dtype: config.placement.precision.as_str().to_string(),
            size_bytes,
            max_context_tokens,
            eos_token_id,
            max_new_tokens: config.generation.max_new_tokens,
            top_k: config.generation.top_k,
            do_sample: config.generation.do_sample,
        };

        info!(
            identity = %config.identity,
            device = %metadata.device,
            size_bytes,
            ?max_context_tokens,
            ?eos_token_id,
            "model server ready"
        );

        Ok(ModelServer::new(
            tokenizer,
            loaded.model,
            config.generation,
            eos_token_id,
            max_context_tokens,
            metadata,
        ))
    }
}

fn resolve_eos(
    tokenizer: &Tokenizer,
    configured: Option<&str>,
    hints: &ModelConfigHints,
) -> Result<Option<u32>, ServiceError> {
    if let Some(token) = configured {
        return tokenizer
            .token_to_id(token)
            .map(Some)
            .ok_or_else(|| ServiceError::Config(format!("EOS token `{token}` is not in the vocabulary")));
    }
    if let Some(id) = hints.eos_token_id {
        return Ok(Some(id));
    }
    Ok(WELL_KNOWN_EOS_TOKENS
        .iter()
        .find_map(|token| tokenizer.token_to_id(token)))
}

