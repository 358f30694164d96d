use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tokio::task;
use tracing::debug;

use crate::{
    error::ServiceError,
    model::{
        backend::CausalLm,
        sampling::{GenerationConfig, Sampler},
        types::{Completion, ModelMetadata, Prompt, StopReason},
    },
};

/// Handle to one loaded tokenizer/model pair. Clones share the same model.
///
/// Generation calls are serialized: the model sits behind a mutex and every
/// completion holds it for the whole decode loop.
#[derive(Clone)]
pub struct ModelServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    tokenizer: Tokenizer,
    model: Mutex<Box<dyn CausalLm>>,
    generation: GenerationConfig,
    eos_token_id: Option<u32>,
    max_context_tokens: Option<usize>,
    metadata: ModelMetadata,
}

impl ModelServer {
    pub(crate) fn new(
        tokenizer: Tokenizer,
        model: Box<dyn CausalLm>,
        generation: GenerationConfig,
        eos_token_id: Option<u32>,
        max_context_tokens: Option<usize>,
        metadata: ModelMetadata,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                tokenizer,
                model: Mutex::new(model),
                generation,
                eos_token_id,
                max_context_tokens,
                metadata,
            }),
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.inner.metadata
    }

    /// Generate a continuation of `prompt` on the blocking pool.
    ///
    /// Dropping the returned future (a caller timeout, a closed connection)
    /// stops the decode loop at the next token and releases the model.
    pub async fn complete(&self, prompt: &Prompt) -> Result<Completion, ServiceError> {
        let inner = self.inner.clone();
        let prompt = prompt.clone();
        let cancel = CancelOnDrop::default();
        let cancelled = cancel.0.clone();
        task::spawn_blocking(move || inner.generate(&prompt, &cancelled))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl fmt::Debug for ModelServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelServer")
            .field("metadata", &self.inner.metadata)
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    fn generate(&self, prompt: &Prompt, cancelled: &AtomicBool) -> Result<Completion, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<u32> = encoding.get_ids().to_vec();
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer("prompt produced no tokens".into()));
        }
        let prompt_tokens = input_ids.len();

        // A truncating tokenizer would silently drop part of the prompt.
        if !encoding.get_overflowing().is_empty() {
            let dropped: usize = encoding
                .get_overflowing()
                .iter()
                .map(|e| e.get_ids().len())
                .sum();
            return Err(ServiceError::ContextOverflow {
                prompt_tokens: prompt_tokens + dropped,
                limit: prompt_tokens,
            });
        }

        let mut budget = self.generation.max_new_tokens;
        if let Some(limit) = self.max_context_tokens {
            if prompt_tokens >= limit {
                return Err(ServiceError::ContextOverflow {
                    prompt_tokens,
                    limit,
                });
            }
            budget = budget.min(limit - prompt_tokens);
        }

        let mut sampler = Sampler::new(&self.generation);
        let mut generated: Vec<u32> = Vec::with_capacity(budget);
        let mut stop_reason = StopReason::MaxTokens;
        let start = Instant::now();

        {
            let mut model = self.model.lock();
            while generated.len() < budget {
                if cancelled.load(Ordering::Relaxed) {
                    debug!(tokens_generated = generated.len(), "generation abandoned by caller");
                    return Err(ServiceError::Inference("generation cancelled".into()));
                }
                let logits = model.next_token_logits(&input_ids)?;
                let next = sampler.next_token(&logits)?;
                if Some(next) == self.eos_token_id {
                    stop_reason = StopReason::Eos;
                    break;
                }
                input_ids.push(next);
                generated.push(next);
            }
        }

        let elapsed = start.elapsed();
        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        debug!(
            prompt_tokens,
            tokens_generated = generated.len(),
            ?stop_reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "generation finished"
        );

        Ok(Completion {
            text,
            stop_reason,
            prompt_tokens,
            tokens_generated: generated.len(),
            elapsed,
        })
    }
}
