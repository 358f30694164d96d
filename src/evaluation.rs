use std::{fs, path::Path, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::ServiceError,
    model::{ModelServer, Prompt, StopReason},
};

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSample {
    pub prompt: String,
    pub reference_substring: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub prompt: String,
    pub completion: String,
    pub stop_reason: StopReason,
    pub tokens_generated: usize,
    pub latency_ms: f64,
    pub tokens_per_second: f64,
    pub reference_match: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    pub avg_latency_ms: f64,
    pub avg_tokens_per_s: f64,
    pub reference_match_rate: Option<f64>,
    /// Share of samples that ended on the end-of-sequence token rather than
    /// the token cap.
    pub eos_stop_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub model_id: String,
    pub samples: Vec<SampleReport>,
    pub aggregate: AggregateMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct BenchmarkOptions {
    pub warmup_iters: usize,
    pub per_sample_timeout: Duration,
}

pub async fn run_benchmark(
    server: &ModelServer,
    options: BenchmarkOptions,
    samples: Vec<BenchmarkSample>,
) -> Result<EvaluationReport, ServiceError> {
    if samples.is_empty() {
        return Err(ServiceError::BadRequest(
            "at least one benchmark sample is required".into(),
        ));
    }

    let prompts = samples
        .iter()
        .map(|sample| Prompt::new(sample.prompt.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    for _ in 0..options.warmup_iters {
        complete_within(server, &prompts[0], options.per_sample_timeout).await?;
    }
    debug!(iters = options.warmup_iters, "warmup finished");

    let mut reports = Vec::with_capacity(samples.len());

    for (sample, prompt) in samples.into_iter().zip(prompts) {
        let completion = complete_within(server, &prompt, options.per_sample_timeout).await?;

        let reference_match = sample.reference_substring.as_ref().map(|needle| {
            completion
                .text
                .to_lowercase()
                .contains(&needle.to_lowercase())
        });

        reports.push(SampleReport {
            prompt: sample.prompt,
            latency_ms: completion.elapsed.as_secs_f64() * 1000.0,
            tokens_per_second: completion.tokens_per_second(),
            tokens_generated: completion.tokens_generated,
            stop_reason: completion.stop_reason,
            completion: completion.text,
            reference_match,
        });
    }

    let aggregate = summarize(&reports);

    Ok(EvaluationReport {
        model_id: server.metadata().model_id.clone(),
        samples: reports,
        aggregate,
    })
}

async fn complete_within(
    server: &ModelServer,
    prompt: &Prompt,
    limit: Duration,
) -> Result<crate::model::Completion, ServiceError> {
    // Timing out drops the call, which stops its decode loop.
    match tokio::time::timeout(limit, server.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "benchmark sample timed out");
            Err(ServiceError::Inference(format!(
                "benchmark sample exceeded {}s",
                limit.as_secs_f64()
            )))
        }
    }
}

pub fn load_samples_from_path(path: &Path) -> Result<Vec<BenchmarkSample>, ServiceError> {
    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| ServiceError::BadRequest(format!("invalid benchmark file: {e}")))?;

    match value {
        serde_json::Value::Array(items) => {
            let mut samples = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                let prompt = item.get("prompt").and_then(|v| v.as_str()).ok_or_else(|| {
                    ServiceError::BadRequest(format!(
                        "benchmark item {idx} missing string field 'prompt'"
                    ))
                })?;
                let reference_substring = item
                    .get("reference_substring")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                samples.push(BenchmarkSample {
                    prompt: prompt.to_string(),
                    reference_substring,
                });
            }
            Ok(samples)
        }
        _ => Err(ServiceError::BadRequest(
            "benchmark file must be a JSON array".into(),
        )),
    }
}

pub fn fallback_samples() -> Vec<BenchmarkSample> {
    vec![
        BenchmarkSample {
            prompt: "The capital of France is".to_string(),
            reference_substring: Some("paris".to_string()),
        },
        BenchmarkSample {
            prompt: "Water freezes at a temperature of".to_string(),
            reference_substring: Some("0".to_string()),
        },
        BenchmarkSample {
            prompt: "Write a haiku about autumn rain.".to_string(),
            reference_substring: None,
        },
    ]
}

fn summarize(reports: &[SampleReport]) -> AggregateMetrics {
    let avg_latency_ms = mean(reports.iter().map(|r| r.latency_ms));
    let avg_tokens_per_s = mean(reports.iter().map(|r| r.tokens_per_second));
    let reference_match_rate = compute_match_rate(reports.iter().filter_map(|r| r.reference_match));
    let eos_stop_rate = compute_match_rate(
        reports
            .iter()
            .map(|r| r.stop_reason == StopReason::Eos),
    )
    .unwrap_or(0.0);

    AggregateMetrics {
        avg_latency_ms,
        avg_tokens_per_s,
        reference_match_rate,
        eos_stop_rate,
    }
}

fn mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut acc = 0.0;
    for value in values {
        count += 1;
        acc += value;
    }
    if count == 0 { 0.0 } else { acc / count as f64 }
}

fn compute_match_rate<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = bool>,
{
    let mut count = 0usize;
    let mut matches = 0usize;
    for value in values {
        count += 1;
        if value {
            matches += 1;
        }
    }
    if count == 0 {
        None
    } else {
        Some(matches as f64 / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn report(latency_ms: f64, stop_reason: StopReason, reference_match: Option<bool>) -> SampleReport {
        SampleReport {
            prompt: "p".into(),
            completion: "c".into(),
            stop_reason,
            tokens_generated: 4,
            latency_ms,
            tokens_per_second: 4000.0 / latency_ms,
            reference_match,
        }
    }

    #[test]
    fn summarize_averages_and_rates() {
        let reports = vec![
            report(100.0, StopReason::Eos, Some(true)),
            report(300.0, StopReason::MaxTokens, Some(false)),
            report(200.0, StopReason::Eos, None),
        ];
        let aggregate = summarize(&reports);
        assert!((aggregate.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(aggregate.reference_match_rate, Some(0.5));
        assert!((aggregate.eos_stop_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn match_rate_is_none_without_references() {
        assert_eq!(compute_match_rate(std::iter::empty()), None);
        assert_eq!(mean(std::iter::empty()), 0.0);
    }

    #[test]
    fn loads_samples_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"prompt": "The capital of France is", "reference_substring": "Paris"}}, {{"prompt": "Hello"}}]"#
        )
        .unwrap();

        let samples = load_samples_from_path(file.path()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].reference_substring.as_deref(), Some("Paris"));
        assert!(samples[1].reference_substring.is_none());
    }

    #[test]
    fn rejects_malformed_sample_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"prompt": "not an array"}}"#).unwrap();
        assert!(matches!(
            load_samples_from_path(file.path()),
            Err(ServiceError::BadRequest(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"reference_substring": "x"}}]"#).unwrap();
        assert!(load_samples_from_path(file.path()).is_err());
    }
}
