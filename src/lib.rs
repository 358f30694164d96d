pub mod client;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod server;

pub use client::{CompletionClient, CompletionOutcome};
pub use config::AppConfig;
pub use error::ServiceError;
pub use evaluation::{BenchmarkSample, EvaluationReport};
pub use model::{
    ArtifactCache, HubFetcher, ModelServer, ModelServerBuilder, ModelServerConfig, Prompt,
};
pub use server::build_router;
