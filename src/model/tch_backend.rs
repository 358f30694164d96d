//! TorchScript causal LM executed through libtorch.

use std::path::Path;

use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    model::{
        backend::{CausalLm, LoadedModel, ModelLoader},
        placement::{DeviceSpec, Placement, Precision},
    },
};

pub struct TorchScriptLoader;

impl ModelLoader for TorchScriptLoader {
    fn load(
        &self,
        weights: &Path,
        placement: &Placement,
        trust_remote_code: bool,
    ) -> Result<LoadedModel, ServiceError> {
        // A TorchScript artifact carries the checkpoint author's compiled graph.
        if !trust_remote_code {
            return Err(ServiceError::Backend(
                "checkpoint ships executable TorchScript; set TRUST_REMOTE_CODE=1 to load it"
                    .into(),
            ));
        }

        let device = resolve_device(placement)?;
        let mut module = CModule::load_on_device(weights, device)
            .map_err(|e| ServiceError::Backend(e.to_string()))?;
        module.to(device, kind_for(placement.precision), false);
        module.set_eval();

        info!(?device, dtype = placement.precision.as_str(), "TorchScript module loaded");

        Ok(LoadedModel {
            model: Box::new(TorchScriptModel { module, device }),
            device: describe(device),
        })
    }
}

struct TorchScriptModel {
    module: CModule,
    device: Device,
}

impl CausalLm for TorchScriptModel {
    fn next_token_logits(&mut self, input_ids: &[u32]) -> Result<Vec<f32>, ServiceError> {
        let ids: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();

        no_grad(|| {
            let input = Tensor::from_slice(&ids)
                .reshape([1, ids.len() as i64])
                .to(self.device);

            // Traced causal LMs return either bare logits or (logits, past).
            let output = self
                .module
                .forward_is(&[IValue::Tensor(input)])
                .map_err(|e| ServiceError::from_runtime(e.to_string()))?;
            let logits = match output {
                IValue::Tensor(t) => t,
                IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                    IValue::Tensor(t) => t.shallow_clone(),
                    _ => {
                        return Err(ServiceError::Inference(
                            "expected tensor as first tuple element".into(),
                        ));
                    }
                },
                _ => {
                    return Err(ServiceError::Inference(
                        "unexpected model output format".into(),
                    ));
                }
            };

            // [1, seq_len, vocab] -> [vocab]
            let last = logits
                .select(1, -1)
                .squeeze()
                .to_kind(Kind::Float)
                .to(Device::Cpu);
            Vec::<f32>::try_from(&last).map_err(|e| ServiceError::Inference(e.to_string()))
        })
    }
}

fn resolve_device(placement: &Placement) -> Result<Device, ServiceError> {
    let fallback = |reason: String| {
        if placement.allow_cpu_fallback {
            warn!(%reason, "falling back to CPU");
            Ok(Device::Cpu)
        } else {
            Err(ServiceError::Backend(format!(
                "{reason} and CPU fallback is disabled"
            )))
        }
    };

    match placement.device {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Auto => {
            if tch::Cuda::is_available() {
                Ok(Device::Cuda(0))
            } else {
                fallback("no CUDA device available".into())
            }
        }
        DeviceSpec::Gpu(idx) => {
            let count = tch::Cuda::device_count();
            let visible = i64::try_from(idx).is_ok_and(|idx| idx < count);
            if tch::Cuda::is_available() && visible {
                Ok(Device::Cuda(idx))
            } else {
                fallback(format!("gpu-{idx} requested but {count} CUDA device(s) visible"))
            }
        }
    }
}

fn kind_for(precision: Precision) -> Kind {
    match precision {
        Precision::Fp32 => Kind::Float,
        Precision::Bf16 => Kind::BFloat16,
        Precision::Fp16 => Kind::Half,
    }
}

fn describe(device: Device) -> String {
    match device {
        Device::Cuda(idx) => format!("gpu-{idx}"),
        Device::Cpu => "cpu".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}
