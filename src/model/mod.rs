pub mod artifacts;
pub mod backend;
mod loader;
pub mod placement;
pub mod sampling;
mod server;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use artifacts::{ArtifactCache, ArtifactFetcher, HubFetcher, ModelArtifacts};
pub use backend::{CausalLm, LoadedModel, ModelLoader};
pub use loader::{DEFAULT_WEIGHTS_FILE, ModelServerBuilder, ModelServerConfig};
pub use placement::{DeviceSpec, Placement, Precision};
pub use sampling::GenerationConfig;
pub use server::ModelServer;
pub use types::{
    Completion, CompletionRequest, CompletionResponse, ModelIdentity, ModelMetadata, Prompt,
    StopReason,
};
