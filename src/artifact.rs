//! Model artifact provisioning.
//!
//! [`ArtifactCache`] guarantees that the model weights exist on local storage before
//! inference. The first caller that finds the artifact absent starts a download;
//! every concurrent caller joins that same in-flight download and observes its
//! outcome. A failed download leaves the artifact absent so the next call retries.
//!
//! Downloads are written to `<file name>.partial` next to the final path and only
//! renamed into place once complete (and checksum-verified when a digest is set),
//! so a reader never observes a partial model.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, error, info};

use crate::errors::{Result, RmbgError};

/// Fixed identity of the model weights: where they live locally and where they
/// are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub url: String,
    /// Expected lower-case hex SHA-256 of the file, if known
    pub sha256: Option<String>,
}

impl ModelArtifact {
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    /// Temporary download location, a sibling of the final path.
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        name.push(".partial");
        self.path.with_file_name(name)
    }

    fn is_present(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("download truncated: expected {expected} bytes, received {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("download task did not complete")]
    Task {
        #[source]
        source: tokio::task::JoinError,
    },
}

impl FetchError {
    pub fn io(path: &Path, operation: &str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            operation: operation.to_string(),
            source,
        }
    }
}

/// Transfers the remote artifact into a local file.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Writes the complete content of `url` into `dest`, returning the byte count.
    async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError>;
}

/// Streams the artifact over HTTP(S) with a byte progress bar.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RmbgError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client))
    }

    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let expected = response.content_length();
        let progress = progress_bar(expected);

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| FetchError::io(dest, "create partial file", e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        let streamed = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(transport)?;
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| FetchError::io(dest, "write chunk", e))?;
                written += chunk.len() as u64;
                progress.set_position(written);
            }

            writer
                .flush()
                .await
                .map_err(|e| FetchError::io(dest, "flush", e))?;
            writer
                .into_inner()
                .sync_all()
                .await
                .map_err(|e| FetchError::io(dest, "sync", e))
        }
        .await;
        // 失敗時もプログレスバーを端末に残さない
        progress.finish_and_clear();
        streamed?;

        check_length(expected, written)
    }
}

fn check_length(expected: Option<u64>, written: u64) -> std::result::Result<u64, FetchError> {
    match expected {
        Some(expected) if expected != written => Err(FetchError::Truncated {
            expected,
            actual: written,
        }),
        _ => Ok(written),
    }
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    let Some(total) = total else {
        return ProgressBar::new_spinner();
    };
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress
}

/// Observable lifecycle of the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Absent,
    Downloading,
    Ready,
}

type Flight = Shared<BoxFuture<'static, std::result::Result<u64, Arc<FetchError>>>>;

enum ArtifactState {
    Absent,
    Downloading { flight: Flight },
    Ready,
}

struct CacheInner {
    state: ArtifactState,
    generation: u64,
}

pub struct ArtifactCache {
    artifact: ModelArtifact,
    fetcher: Arc<dyn ArtifactFetcher>,
    inner: Arc<Mutex<CacheInner>>,
}

impl ArtifactCache {
    pub fn new(artifact: ModelArtifact, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            artifact,
            fetcher,
            inner: Arc::new(Mutex::new(CacheInner {
                state: ArtifactState::Absent,
                generation: 0,
            })),
        }
    }

    pub const fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn status(&self) -> ArtifactStatus {
        match self.inner.lock().state {
            ArtifactState::Absent => ArtifactStatus::Absent,
            ArtifactState::Downloading { .. } => ArtifactStatus::Downloading,
            ArtifactState::Ready => ArtifactStatus::Ready,
        }
    }

    /// Makes sure the artifact is present at its final path.
    ///
    /// Returns immediately once Ready. Concurrent callers share one download and
    /// all observe its result; after a failure the artifact is Absent again and the
    /// next call starts a fresh download. The download runs on its own task, so it
    /// completes even when every caller stops waiting.
    pub async fn ensure_ready(&self) -> Result<()> {
        let Some(flight) = self.join_or_start() else {
            return Ok(());
        };

        flight
            .await
            .map(|_| ())
            .map_err(|source| RmbgError::Provisioning {
                url: self.artifact.url.clone(),
                source,
            })
    }

    /// Returns the in-flight download to wait on, or `None` when already Ready.
    fn join_or_start(&self) -> Option<Flight> {
        let mut inner = self.inner.lock();

        match &inner.state {
            ArtifactState::Downloading { flight } => return Some(flight.clone()),
            ArtifactState::Ready => return None,
            ArtifactState::Absent => {}
        }

        if self.artifact.is_present() {
            info!(path = %self.artifact.path.display(), "Model artifact already cached");
            inner.state = ArtifactState::Ready;
            return None;
        }

        inner.generation += 1;
        let generation = inner.generation;
        let task = tokio::spawn(settle(
            Arc::clone(&self.inner),
            generation,
            provision(self.artifact.clone(), Arc::clone(&self.fetcher)),
        ));
        let flight = task
            .map(|joined| joined.unwrap_or_else(|e| Err(Arc::new(FetchError::Task { source: e }))))
            .boxed()
            .shared();
        inner.state = ArtifactState::Downloading {
            flight: flight.clone(),
        };
        Some(flight)
    }
}

/// Runs one download and records its outcome, unless a newer download has
/// replaced it in the meantime.
async fn settle(
    inner: Arc<Mutex<CacheInner>>,
    generation: u64,
    download: impl std::future::Future<Output = std::result::Result<u64, Arc<FetchError>>>,
) -> std::result::Result<u64, Arc<FetchError>> {
    let outcome = download.await;

    let mut inner = inner.lock();
    if inner.generation == generation
        && matches!(inner.state, ArtifactState::Downloading { .. })
    {
        inner.state = match outcome {
            Ok(_) => ArtifactState::Ready,
            Err(_) => ArtifactState::Absent,
        };
    }
    outcome
}

async fn provision(
    artifact: ModelArtifact,
    fetcher: Arc<dyn ArtifactFetcher>,
) -> std::result::Result<u64, Arc<FetchError>> {
    info!(
        url = %artifact.url,
        path = %artifact.path.display(),
        "Downloading model artifact"
    );

    match download(&artifact, fetcher.as_ref()).await {
        Ok(bytes) => {
            info!(path = %artifact.path.display(), bytes, "Model artifact cached");
            Ok(bytes)
        }
        Err(e) => {
            error!(url = %artifact.url, error = %e, "Model artifact download failed");
            Err(Arc::new(e))
        }
    }
}

async fn download(
    artifact: &ModelArtifact,
    fetcher: &dyn ArtifactFetcher,
) -> std::result::Result<u64, FetchError> {
    if let Some(parent) = artifact.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::io(parent, "create model directory", e))?;
    }

    let partial = artifact.partial_path();
    let result = async {
        let bytes = fetcher.fetch(&artifact.url, &partial).await?;
        if let Some(expected) = &artifact.sha256 {
            verify_checksum(&partial, expected).await?;
        }
        tokio::fs::rename(&partial, &artifact.path)
            .await
            .map_err(|e| FetchError::io(&artifact.path, "publish artifact", e))?;
        Ok(bytes)
    }
    .await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            debug!(path = %partial.display(), error = %e, "No partial file to remove");
        }
    }
    result
}

async fn verify_checksum(path: &Path, expected: &str) -> std::result::Result<(), FetchError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FetchError::io(path, "open for verification", e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| FetchError::io(path, "read for verification", e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if actual != expected {
        return Err(FetchError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
