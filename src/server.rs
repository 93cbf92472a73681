//! HTTP surface: upload form, upload endpoint and health check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};

use crate::artifact::ArtifactStatus;
use crate::errors::{Result, RmbgError};
use crate::orchestrator::{ImageRequest, RequestOrchestrator};
use crate::traits::ImageSegmentationModel;

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

const UPLOAD_FORM: &str = r#"<!doctype html>
<html>
<head><title>Remove background</title></head>
<body>
<h1>Remove image background</h1>
<form method="post" enctype="multipart/form-data">
<input type="file" name="file" accept="image/*" required>
<input type="submit" value="Upload">
</form>
</body>
</html>
"#;

impl IntoResponse for RmbgError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RmbgError::MissingInput { .. } => (StatusCode::BAD_REQUEST, "No file uploaded"),
            RmbgError::UploadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "File too large"),
            RmbgError::Decode { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "Error processing image"),
            RmbgError::Inference { .. } | RmbgError::Encode { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Error processing image")
            }
            RmbgError::Provisioning { .. } => (StatusCode::SERVICE_UNAVAILABLE, "Model unavailable"),
            RmbgError::Configuration { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        (status, message).into_response()
    }
}

pub fn router<M: ImageSegmentationModel + 'static>(
    orchestrator: Arc<RequestOrchestrator<M>>,
    max_upload_bytes: usize,
) -> Router {
    Router::new()
        .route("/", get(upload_form).post(upload::<M>))
        .route("/healthz", get(healthz::<M>))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(orchestrator)
}

async fn upload_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

async fn upload<M: ImageSegmentationModel + 'static>(
    State(orchestrator): State<Arc<RequestOrchestrator<M>>>,
    multipart: Multipart,
) -> Result<Response> {
    let request = read_file_field(multipart).await?;
    let result = orchestrator.handle_upload(request).await?;

    let disposition = format!("attachment; filename=\"{}\"", result.filename);
    Ok((
        [(header::CONTENT_TYPE, "image/png")],
        [(header::CONTENT_DISPOSITION, disposition)],
        result.png,
    )
        .into_response())
}

/// Pulls the `file` field out of the form, skipping anything else.
async fn read_file_field(mut multipart: Multipart) -> Result<Option<ImageRequest>> {
    let malformed = |e: axum::extract::multipart::MultipartError| {
        warn!(error = %e, status = %e.status(), "Unreadable multipart body");
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            RmbgError::UploadTooLarge {
                reason: e.to_string(),
            }
        } else {
            RmbgError::missing_input(format!("unreadable multipart body: {e}"))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(malformed)?;
        return Ok(Some(ImageRequest {
            filename,
            bytes: bytes.to_vec(),
        }));
    }
    Ok(None)
}

async fn healthz<M: ImageSegmentationModel + 'static>(
    State(orchestrator): State<Arc<RequestOrchestrator<M>>>,
) -> (StatusCode, &'static str) {
    match orchestrator.artifacts().status() {
        ArtifactStatus::Ready => (StatusCode::OK, "ok"),
        ArtifactStatus::Downloading => (StatusCode::SERVICE_UNAVAILABLE, "downloading"),
        ArtifactStatus::Absent => (StatusCode::SERVICE_UNAVAILABLE, "absent"),
    }
}

/// Binds `addr` and serves until Ctrl-C or SIGTERM.
pub async fn serve<M: ImageSegmentationModel + 'static>(
    orchestrator: Arc<RequestOrchestrator<M>>,
    addr: SocketAddr,
    max_upload_bytes: usize,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, router(orchestrator, max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutting down");
}
