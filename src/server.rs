use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use parking_lot::RwLock;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    evaluation::{
        BenchmarkOptions, EvaluationReport, fallback_samples, load_samples_from_path,
        run_benchmark,
    },
    model::{CompletionRequest, CompletionResponse, ModelMetadata, ModelServer},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub server: ModelServer,
    pub evaluation: Arc<RwLock<Option<EvaluationReport>>>,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    evaluation: Option<EvaluationReport>,
}

pub fn build_router(config: Arc<AppConfig>, server: ModelServer) -> Router {
    let state = AppState {
        evaluation: Arc::new(RwLock::new(None)),
        server,
        config,
    };

    Router::new()
        .route("/", post(complete))
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/evaluate", post(run_evaluation))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn complete(
    State(state): State<AppState>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, ServiceError> {
    let Json(request) = payload.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let prompt = request.into_prompt()?;

    let completion = state.server.complete(&prompt).await?;
    info!(
        prompt_tokens = completion.prompt_tokens,
        tokens_generated = completion.tokens_generated,
        stop_reason = ?completion.stop_reason,
        elapsed_ms = completion.elapsed.as_millis() as u64,
        "completion served"
    );

    Ok(Json(CompletionResponse::from(completion)))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    let evaluation = state.evaluation.read().clone();

    Json(MetadataResponse {
        model: state.server.metadata().clone(),
        evaluation,
    })
}

async fn run_evaluation(
    State(state): State<AppState>,
) -> Result<Json<EvaluationReport>, ServiceError> {
    let samples = if let Some(path) = state.config.eval_prompts_path.as_ref() {
        load_samples_from_path(path)?
    } else {
        fallback_samples()
    };

    info!(count = samples.len(), "running evaluation benchmark");

    let options = BenchmarkOptions {
        warmup_iters: state.config.eval_warmup_iters,
        per_sample_timeout: state.config.eval_timeout,
    };
    let report = run_benchmark(&state.server, options, samples).await?;
    state.evaluation.write().replace(report.clone());

    Ok(Json(report))
}
