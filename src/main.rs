use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_completion_service::{
    AppConfig, ArtifactCache, HubFetcher, ModelServerBuilder, build_router, model::ModelLoader,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        identity = %config.model.identity,
        cache = %config.cache_dir.display(),
        "loading model artifacts"
    );

    let fetcher = HubFetcher::new(
        &config.hub_endpoint,
        config.hub_token.as_ref().map(|t| t.expose().to_string()),
        config.hub_timeout,
    )?;
    let server = ModelServerBuilder::new(
        config.model.clone(),
        ArtifactCache::new(&config.cache_dir),
        Arc::new(fetcher),
        model_loader()?,
    )
    .initialize()
    .await?;

    let router = build_router(config.clone(), server);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    let serve = axum::serve(listener, router);
    match config.server_lifetime {
        Some(lifetime) => match tokio::time::timeout(lifetime, serve).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(lifetime_secs = lifetime.as_secs(), "server lifetime elapsed; shutting down");
            }
        },
        None => serve.await?,
    }

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn model_loader() -> anyhow::Result<Arc<dyn ModelLoader>> {
    Ok(Arc::new(llm_completion_service::model::tch_backend::TorchScriptLoader))
}

#[cfg(not(feature = "tch-backend"))]
fn model_loader() -> anyhow::Result<Arc<dyn ModelLoader>> {
    anyhow::bail!("built without a model backend; enable the `tch-backend` feature")
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
