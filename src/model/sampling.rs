//! Decoding parameters and next-token selection.

use rand::{SeedableRng, distributions::Distribution, distributions::WeightedIndex, rngs::StdRng};

use crate::error::ServiceError;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 150;
pub const DEFAULT_TOP_K: usize = 10;

/// Decoding parameters applied to every completion. Exactly one sequence is
/// produced per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub do_sample: bool,
    /// Fixed seed for the sampler; `None` draws from OS entropy per call.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            top_k: DEFAULT_TOP_K,
            do_sample: true,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Argmax decoding, deterministic for a given model.
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.max_new_tokens == 0 {
            return Err(ServiceError::Config("max_new_tokens must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(ServiceError::Config("top_k must be positive".into()));
        }
        Ok(())
    }

    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.top_k == 1
    }
}

/// Per-call token sampler. One is created for every completion so a seeded
/// configuration replays the same draws for the same prompt.
pub struct Sampler {
    top_k: usize,
    greedy: bool,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            top_k: config.top_k,
            greedy: config.is_greedy(),
            rng,
        }
    }

    pub fn next_token(&mut self, logits: &[f32]) -> Result<u32, ServiceError> {
        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, logit)| logit.is_finite())
            .map(|(idx, &logit)| (idx as u32, logit))
            .collect();
        if candidates.is_empty() {
            return Err(ServiceError::Inference(
                "model produced no finite logits".into(),
            ));
        }

        let by_logit_desc = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1);

        if self.greedy {
            candidates.sort_unstable_by(by_logit_desc);
            return Ok(candidates[0].0);
        }

        let k = self.top_k.min(candidates.len());
        if k < candidates.len() {
            candidates.select_nth_unstable_by(k - 1, by_logit_desc);
            candidates.truncate(k);
        }

        let max_logit = candidates
            .iter()
            .map(|(_, logit)| *logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = candidates
            .iter()
            .map(|(_, logit)| (logit - max_logit).exp())
            .collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| ServiceError::Inference(format!("invalid sampling weights: {e}")))?;

        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampling(top_k: usize, seed: u64) -> GenerationConfig {
        GenerationConfig {
            top_k,
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_serving_contract() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 150);
        assert_eq!(config.top_k, 10);
        assert!(config.do_sample);
        assert!(config.seed.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_limits() {
        let config = GenerationConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = GenerationConfig {
            max_new_tokens: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn greedy_takes_argmax() {
        let mut sampler = Sampler::new(&GenerationConfig::greedy());
        let logits = [0.1, 0.5, 0.3, 0.9, 0.2];
        for _ in 0..10 {
            assert_eq!(sampler.next_token(&logits).unwrap(), 3);
        }
    }

    #[test]
    fn top_k_of_one_is_greedy() {
        let mut sampler = Sampler::new(&sampling(1, 7));
        assert_eq!(sampler.next_token(&[1.0, 5.0, 3.0]).unwrap(), 1);
    }

    #[test]
    fn top_k_restricts_candidates() {
        let mut sampler = Sampler::new(&sampling(2, 42));
        let logits = [1.0, 10.0, 9.0, 0.5, 0.1];
        for _ in 0..200 {
            let token = sampler.next_token(&logits).unwrap();
            assert!(token == 1 || token == 2, "unexpected token {token}");
        }
    }

    #[test]
    fn sampling_spreads_across_top_k() {
        let mut sampler = Sampler::new(&sampling(10, 3));
        let logits = vec![1.0f32; 32];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let token = sampler.next_token(&logits).unwrap();
            assert!((token as usize) < 32);
            seen.insert(token);
        }
        assert!(seen.len() <= 10);
        assert!(seen.len() > 1);
    }

    #[test]
    fn same_seed_replays_draws() {
        let logits: Vec<f32> = (0..50).map(|i| (i % 7) as f32).collect();
        let mut a = Sampler::new(&sampling(10, 99));
        let mut b = Sampler::new(&sampling(10, 99));
        for _ in 0..50 {
            assert_eq!(a.next_token(&logits).unwrap(), b.next_token(&logits).unwrap());
        }
    }

    #[test]
    fn non_finite_logits_are_skipped() {
        let mut sampler = Sampler::new(&sampling(10, 1));
        let logits = [f32::NAN, f32::NEG_INFINITY, 2.0];
        assert_eq!(sampler.next_token(&logits).unwrap(), 2);

        assert!(sampler.next_token(&[f32::NAN]).is_err());
        assert!(sampler.next_token(&[]).is_err());
    }
}
