use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rmbg_rs::{
    server, ArtifactCache, ArtifactStatus, Config, HttpFetcher, InferencePipeline, Model,
    RequestOrchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let artifacts = Arc::new(ArtifactCache::new(
        config.artifact(),
        Arc::new(HttpFetcher::new()?),
    ));

    if config.lazy_provision {
        info!("Model provisioning deferred to the first request");
    } else {
        artifacts
            .ensure_ready()
            .await
            .with_context(|| format!("Failed to provision model from {}", config.model_url))?;
    }

    let model = Arc::new(Model::new(
        &config.model_path,
        config.device_id,
        config.intra_threads,
    ));
    if artifacts.status() == ArtifactStatus::Ready {
        let warm = Arc::clone(&model);
        tokio::task::spawn_blocking(move || warm.warm_up())
            .await
            .context("Model warm-up task panicked")?
            .context("Failed to load model")?;
    } else {
        warn!(path = %config.model_path.display(), "Model not cached yet, session will load on first request");
    }

    let pipeline = InferencePipeline::new(model, config.segment_options());
    let orchestrator = Arc::new(RequestOrchestrator::new(
        artifacts,
        pipeline,
        config.inference_workers,
    ));

    info!(
        workers = config.inference_workers,
        post_process_mask = config.segment_options().post_process_mask,
        "Background removal service ready"
    );
    server::serve(orchestrator, config.addr(), config.max_upload_bytes())
        .await
        .with_context(|| format!("Server on {} failed", config.addr()))
}
