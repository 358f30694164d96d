#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use llm_completion_service::{
    ArtifactCache, ModelServer, ModelServerBuilder, ModelServerConfig, ServiceError,
    model::{
        ArtifactFetcher, CausalLm, GenerationConfig, LoadedModel, ModelIdentity, ModelLoader,
        Placement, Precision,
    },
};
use serde_json::json;

pub const PROMPT: &str = "The capital of France is";
pub const WEIGHTS_FILE: &str = "model.ts";

pub const VOCAB: &[&str] = &[
    "<eos>", "<unk>", "the", "capital", "of", "france", "is", "paris", "a", "city", "in",
    "europe",
];

const EOS: usize = 0;
const THE: usize = 2;
const EUROPE: usize = 11;

/// Lowercasing whitespace WordLevel tokenizer over [`VOCAB`].
pub fn tokenizer_json() -> String {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), json!(id)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": EOS,
            "content": "<eos>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    })
    .to_string()
}

pub fn model_config_json(max_positions: usize) -> String {
    json!({ "eos_token_id": EOS, "max_position_embeddings": max_positions }).to_string()
}

/// Serves a fixed set of files and counts every fetch.
pub struct MemoryFetcher {
    files: HashMap<String, Vec<u8>>,
    pub calls: AtomicUsize,
}

impl MemoryFetcher {
    pub fn checkpoint() -> Self {
        Self::with_files(&[
            ("tokenizer.json", tokenizer_json().into_bytes()),
            ("config.json", model_config_json(1024).into_bytes()),
            (WEIGHTS_FILE, b"torchscript".to_vec()),
        ])
    }

    pub fn empty() -> Self {
        Self::with_files(&[])
    }

    pub fn with_files(files: &[(&str, Vec<u8>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn fetch(
        &self,
        identity: &ModelIdentity,
        filename: &str,
        dest: &Path,
    ) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .files
            .get(filename)
            .ok_or_else(|| ServiceError::ArtifactMissing(format!("{identity}/{filename}")))?;
        fs::write(dest, bytes)?;
        Ok(())
    }
}

/// Deterministic model that continues "the capital of france is paris a city
/// in europe". After "europe" it emits EOS, or starts over when `terminate`
/// is off.
pub struct ChainModel {
    terminate: bool,
    step_delay: Duration,
    calls: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
}

impl CausalLm for ChainModel {
    fn next_token_logits(&mut self, input_ids: &[u32]) -> Result<Vec<f32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::OutOfMemory(
                "CUDA out of memory. Tried to allocate 20.00 MiB".into(),
            ));
        }

        let last = input_ids.last().copied().unwrap_or(0) as usize;
        let next = match last {
            EUROPE if self.terminate => EOS,
            EUROPE => THE,
            id if id > EUROPE || id < THE => THE,
            id => id + 1,
        };
        let mut logits = vec![0.0f32; VOCAB.len()];
        logits[next] = 50.0;
        Ok(logits)
    }
}

#[derive(Clone)]
pub struct ChainLoader {
    pub terminate: bool,
    /// Time each forward pass takes.
    pub step_delay: Duration,
    pub calls: Arc<AtomicUsize>,
    pub fail_next: Arc<AtomicBool>,
}

impl ChainLoader {
    pub fn terminating() -> Self {
        Self {
            terminate: true,
            step_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn looping() -> Self {
        Self {
            terminate: false,
            ..Self::terminating()
        }
    }

    pub fn slow(step_delay: Duration) -> Self {
        Self {
            step_delay,
            ..Self::looping()
        }
    }

    pub fn model_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ChainLoader {
    fn load(
        &self,
        weights: &Path,
        _placement: &Placement,
        trust_remote_code: bool,
    ) -> Result<LoadedModel, ServiceError> {
        if !trust_remote_code {
            return Err(ServiceError::Backend("remote code not trusted".into()));
        }
        if !weights.exists() {
            return Err(ServiceError::Backend(format!("missing {}", weights.display())));
        }
        Ok(LoadedModel {
            model: Box::new(ChainModel {
                terminate: self.terminate,
                step_delay: self.step_delay,
                calls: self.calls.clone(),
                fail_next: self.fail_next.clone(),
            }),
            device: "cpu".to_string(),
        })
    }
}

pub fn server_config(generation: GenerationConfig) -> ModelServerConfig {
    let mut config = ModelServerConfig::new(ModelIdentity::parse("acme/chain-lm").unwrap());
    config.weights_file = WEIGHTS_FILE.to_string();
    config.placement = Placement::cpu(Precision::Fp32);
    config.generation = generation;
    config
}

pub async fn initialize(
    cache_root: &Path,
    config: ModelServerConfig,
    fetcher: Arc<MemoryFetcher>,
    loader: ChainLoader,
) -> Result<ModelServer, ServiceError> {
    ModelServerBuilder::new(
        config,
        ArtifactCache::new(cache_root),
        fetcher,
        Arc::new(loader),
    )
    .initialize()
    .await
}

pub async fn ready_server(cache_root: &Path, generation: GenerationConfig, loader: ChainLoader) -> ModelServer {
    initialize(
        cache_root,
        server_config(generation),
        Arc::new(MemoryFetcher::checkpoint()),
        loader,
    )
    .await
    .expect("fixture model initializes")
}
