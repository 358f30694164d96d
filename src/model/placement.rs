use std::{fmt, str::FromStr};

use crate::error::ServiceError;

/// Where model weights are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpec {
    /// First available accelerator.
    #[default]
    Auto,
    Cpu,
    Gpu(usize),
}

impl FromStr for DeviceSpec {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "auto" => return Ok(DeviceSpec::Auto),
            "cpu" => return Ok(DeviceSpec::Cpu),
            "gpu" | "cuda" => return Ok(DeviceSpec::Gpu(0)),
            _ => {}
        }

        let index = lower
            .strip_prefix("gpu-")
            .or_else(|| lower.strip_prefix("gpu:"))
            .or_else(|| lower.strip_prefix("cuda:"))
            .and_then(|idx| idx.parse::<usize>().ok());
        index
            .map(DeviceSpec::Gpu)
            .ok_or_else(|| ServiceError::Config(format!("unknown device `{raw}`")))
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Auto => f.write_str("auto"),
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Gpu(idx) => write!(f, "gpu-{idx}"),
        }
    }
}

/// Numeric format the weights are cast to after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Fp32,
    #[default]
    Bf16,
    Fp16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "float32",
            Precision::Bf16 => "bfloat16",
            Precision::Fp16 => "float16",
        }
    }
}

impl FromStr for Precision {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(Precision::Fp32),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "fp16" | "f16" | "float16" | "half" => Ok(Precision::Fp16),
            _ => Err(ServiceError::Config(format!("unknown precision `{raw}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    pub device: DeviceSpec,
    pub precision: Precision,
    /// Run on the CPU when the requested accelerator is missing instead of
    /// failing startup.
    pub allow_cpu_fallback: bool,
}

impl Placement {
    pub fn cpu(precision: Precision) -> Self {
        Self {
            device: DeviceSpec::Cpu,
            precision,
            allow_cpu_fallback: true,
        }
    }
}
