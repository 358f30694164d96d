use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;

use crate::model::{
    DEFAULT_WEIGHTS_FILE, DeviceSpec, GenerationConfig, ModelIdentity, ModelServerConfig,
    Placement, Precision,
};

pub const DEFAULT_MODEL_ID: &str = "tiiuae/falcon-7b-instruct";
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Secret value that never shows up in `Debug` output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model: ModelServerConfig,
    pub cache_dir: PathBuf,
    pub hub_endpoint: String,
    pub hub_token: Option<Secret>,
    pub hub_timeout: Duration,
    pub eval_prompts_path: Option<PathBuf>,
    pub eval_warmup_iters: usize,
    pub eval_timeout: Duration,
    /// Hard cap on how long the process serves before shutting down.
    pub server_lifetime: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_id = lookup("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let revision = lookup("MODEL_REVISION").unwrap_or_else(|| "main".to_string());
        let identity = ModelIdentity::with_revision(&model_id, &revision)?;

        let mut placement = Placement::default();
        if let Some(raw) = lookup("DEVICE") {
            placement.device = raw.parse::<DeviceSpec>().context("DEVICE")?;
        }
        if let Some(raw) = lookup("PRECISION") {
            placement.precision = raw.parse::<Precision>().context("PRECISION")?;
        }
        placement.allow_cpu_fallback = flag(lookup("ALLOW_CPU_FALLBACK"), false);

        let defaults = GenerationConfig::default();
        let generation = GenerationConfig {
            max_new_tokens: parsed("MAX_NEW_TOKENS")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_new_tokens),
            top_k: parsed("TOP_K").map(|v| v as usize).unwrap_or(defaults.top_k),
            do_sample: flag(lookup("DO_SAMPLE"), defaults.do_sample),
            seed: parsed("SAMPLING_SEED"),
        };
        generation.validate()?;

        let model = ModelServerConfig {
            identity,
            weights_file: lookup("MODEL_WEIGHTS_FILE")
                .unwrap_or_else(|| DEFAULT_WEIGHTS_FILE.to_string()),
            placement,
            generation,
            max_context_tokens: parsed("MAX_CONTEXT_TOKENS").map(|v| v as usize),
            eos_token: lookup("EOS_TOKEN").filter(|t| !t.is_empty()),
            trust_remote_code: flag(lookup("TRUST_REMOTE_CODE"), true),
        };

        let cache_dir = lookup("MODEL_CACHE_DIR")
            .or_else(|| lookup("TRANSFORMERS_CACHE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("model_cache"));

        let hub_endpoint =
            lookup("HF_ENDPOINT").unwrap_or_else(|| DEFAULT_HUB_ENDPOINT.to_string());
        let hub_token = lookup("HF_TOKEN").filter(|t| !t.is_empty()).map(Secret);
        let hub_timeout = parsed("HUB_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(3600));

        let eval_prompts_path = lookup("EVAL_PROMPTS_PATH").map(PathBuf::from);
        let eval_warmup_iters = parsed("EVAL_WARMUP_ITERS").map(|v| v as usize).unwrap_or(1);
        let eval_timeout = parsed("EVAL_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(120));

        let server_lifetime = parsed("SERVER_LIFETIME_SECS").map(Duration::from_secs);

        Ok(Self {
            listen_addr,
            model,
            cache_dir,
            hub_endpoint,
            hub_token,
            hub_timeout,
            eval_prompts_path,
            eval_warmup_iters,
            eval_timeout,
            server_lifetime,
        })
    }
}

fn flag(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_reflect_serving_contract() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.model.identity.repo_id(), DEFAULT_MODEL_ID);
        assert_eq!(config.model.identity.revision(), "main");
        assert_eq!(config.model.generation, GenerationConfig::default());
        assert_eq!(config.model.placement.device, DeviceSpec::Auto);
        assert_eq!(config.model.placement.precision, Precision::Bf16);
        assert!(config.model.trust_remote_code);
        assert_eq!(config.cache_dir, PathBuf::from("model_cache"));
        assert!(config.server_lifetime.is_none());
        assert!(config.hub_token.is_none());
    }

    #[test]
    fn cache_dir_honours_transformers_cache() {
        let config = config_from(&[("TRANSFORMERS_CACHE", "/root/model_cache")]).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/root/model_cache"));

        let config = config_from(&[
            ("TRANSFORMERS_CACHE", "/root/model_cache"),
            ("MODEL_CACHE_DIR", "/mnt/cache"),
        ])
        .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/mnt/cache"));
    }

    #[test]
    fn placement_and_generation_overrides() {
        let config = config_from(&[
            ("DEVICE", "gpu-1"),
            ("PRECISION", "fp16"),
            ("ALLOW_CPU_FALLBACK", "yes"),
            ("TOP_K", "1"),
            ("DO_SAMPLE", "false"),
            ("SAMPLING_SEED", "7"),
            ("MAX_CONTEXT_TOKENS", "2048"),
        ])
        .unwrap();
        assert_eq!(config.model.placement.device, DeviceSpec::Gpu(1));
        assert_eq!(config.model.placement.precision, Precision::Fp16);
        assert!(config.model.placement.allow_cpu_fallback);
        assert_eq!(config.model.generation.top_k, 1);
        assert!(!config.model.generation.do_sample);
        assert_eq!(config.model.generation.seed, Some(7));
        assert_eq!(config.model.max_context_tokens, Some(2048));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("DEVICE", "tpu")]).is_err());
        assert!(config_from(&[("PRECISION", "int4")]).is_err());
        assert!(config_from(&[("TOP_K", "0")]).is_err());
        assert!(config_from(&[("MODEL_ID", "../escape")]).is_err());
    }

    #[test]
    fn hub_token_is_redacted() {
        let config = config_from(&[("HF_TOKEN", "hf_supersecret")]).unwrap();
        assert_eq!(config.hub_token.as_ref().unwrap().expose(), "hf_supersecret");
        assert!(!format!("{config:?}").contains("hf_supersecret"));
    }
}
