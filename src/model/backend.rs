use std::path::Path;

use crate::{error::ServiceError, model::placement::Placement};

/// A loaded causal language model.
pub trait CausalLm: Send {
    /// Logits over the vocabulary for the token that follows `input_ids`.
    fn next_token_logits(&mut self, input_ids: &[u32]) -> Result<Vec<f32>, ServiceError>;
}

pub struct LoadedModel {
    pub model: Box<dyn CausalLm>,
    /// Device the weights actually landed on, after fallback.
    pub device: String,
}

/// Turns a weights artifact into a [`CausalLm`] on the requested placement.
pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        weights: &Path,
        placement: &Placement,
        trust_remote_code: bool,
    ) -> Result<LoadedModel, ServiceError>;
}
