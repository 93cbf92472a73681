use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::artifact::ArtifactCache;
use crate::errors::{Result, RmbgError, Stage};
use crate::pipeline::InferencePipeline;
use crate::traits::ImageSegmentationModel;

/// Suffix appended to every suggested download name.
pub const OUTPUT_SUFFIX: &str = "_rmbg.png";

/// One uploaded file, alive for the duration of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageRequest {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: Some(filename.into()),
            bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub png: Vec<u8>,
    pub filename: String,
    pub elapsed: Duration,
}

/// Per-request coordinator.
///
/// Validates the upload, makes sure the model is provisioned, then runs the
/// pipeline on the blocking pool. At most `workers` pipelines run at once.
pub struct RequestOrchestrator<M: ImageSegmentationModel + 'static> {
    artifacts: Arc<ArtifactCache>,
    pipeline: Arc<InferencePipeline<M>>,
    permits: Arc<Semaphore>,
}

impl<M: ImageSegmentationModel + 'static> RequestOrchestrator<M> {
    pub fn new(artifacts: Arc<ArtifactCache>, pipeline: InferencePipeline<M>, workers: usize) -> Self {
        Self {
            artifacts,
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn pipeline(&self) -> &InferencePipeline<M> {
        &self.pipeline
    }

    /// Startup provisioning; the same call is repeated before every request.
    pub async fn prepare(&self) -> Result<()> {
        self.artifacts.ensure_ready().await
    }

    pub async fn handle_upload(&self, upload: Option<ImageRequest>) -> Result<InferenceResult> {
        let request = match validate(upload) {
            Ok(request) => request,
            Err(err) => {
                warn!(reason = %err, "Rejected upload");
                return Err(err);
            }
        };
        let input = request.filename.clone().unwrap_or_default();

        match self.run(request).await {
            Ok((png, elapsed)) => {
                info!(
                    input = %input,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Processed {} in {:.3}s",
                    input,
                    elapsed.as_secs_f64()
                );
                Ok(InferenceResult {
                    png,
                    filename: output_filename(&input),
                    elapsed,
                })
            }
            Err(err) => {
                let record = err.failure_record();
                error!(
                    input = %input,
                    kind = ?record.kind,
                    stage = %record.stage,
                    error = %error_chain(&err),
                    "Failed to process upload"
                );
                Err(err)
            }
        }
    }

    async fn run(&self, request: ImageRequest) -> Result<(Vec<u8>, Duration)> {
        self.artifacts.ensure_ready().await?;

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| RmbgError::inference(Stage::Segment, "inference slot", e))?;

        let pipeline = Arc::clone(&self.pipeline);
        let started = Instant::now();
        let png = tokio::task::spawn_blocking(move || pipeline.process(&request.bytes))
            .await
            .map_err(|e| RmbgError::inference(Stage::Segment, "inference worker", e))??;
        Ok((png, started.elapsed()))
    }
}

fn validate(upload: Option<ImageRequest>) -> Result<ImageRequest> {
    let request = upload.ok_or_else(|| RmbgError::missing_input("no file field"))?;
    match request.filename.as_deref() {
        Some(name) if !name.trim().is_empty() => Ok(request),
        _ => Err(RmbgError::missing_input("empty file name")),
    }
}

/// `photo.jpg` -> `photo_rmbg.png`. Directory parts and the extension are
/// dropped; anything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn output_filename(input: &str) -> String {
    let base = input.rsplit(['/', '\\']).next().unwrap_or_default();
    let stem = match base.rfind('.') {
        Some(0) | None => base,
        Some(dot) => &base[..dot],
    };
    let stem: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}{OUTPUT_SUFFIX}")
}

fn error_chain(err: &RmbgError) -> String {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
