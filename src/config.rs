use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::thread;

use clap::Parser;

use crate::artifact::ModelArtifact;
use crate::traits::SegmentOptions;

pub const DEFAULT_MODEL_URL: &str =
    "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2net.onnx";
pub const DEFAULT_PORT: u16 = 5100;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Local path of the cached model weights
    #[arg(long, env = "RMBG_MODEL_PATH", default_value_os_t = default_model_path())]
    pub model_path: PathBuf,

    /// Where to download the model from when it is not cached yet
    #[arg(long, env = "RMBG_MODEL_URL", default_value = DEFAULT_MODEL_URL)]
    pub model_url: String,

    /// Expected SHA-256 of the downloaded model (lower-case hex)
    #[arg(long, env = "RMBG_MODEL_SHA256", value_parser = check_sha256)]
    pub model_sha256: Option<String>,

    #[arg(long, env = "RMBG_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    #[arg(short, long, env = "RMBG_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(short, long, env = "RMBG_DEVICE_ID", default_value_t = 0)]
    pub device_id: i32,

    /// ONNX Runtime intra-op threads (0 lets the runtime decide)
    #[arg(long, env = "RMBG_INTRA_THREADS", default_value_t = 0)]
    pub intra_threads: usize,

    /// Maximum number of images processed at the same time
    #[arg(long, env = "RMBG_INFERENCE_WORKERS", default_value_t = default_workers(), value_parser = check_positive)]
    pub inference_workers: usize,

    #[arg(long, env = "RMBG_MAX_UPLOAD_MB", default_value_t = 32, value_parser = check_positive)]
    pub max_upload_mb: usize,

    /// Return the unrefined model mask instead of the cleaned-up matte
    #[arg(long, env = "RMBG_RAW_MASK")]
    pub raw_mask: bool,

    /// Do not download the model at startup; the first request does it instead
    #[arg(long, env = "RMBG_LAZY_PROVISION")]
    pub lazy_provision: bool,
}

impl Config {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn artifact(&self) -> ModelArtifact {
        ModelArtifact {
            path: self.model_path.clone(),
            url: self.model_url.clone(),
            sha256: self.model_sha256.clone(),
        }
    }

    pub const fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            post_process_mask: !self.raw_mask,
        }
    }

    pub const fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

/// `$U2NET_HOME/u2net.onnx`, falling back to `~/.u2net/u2net.onnx`.
pub fn default_model_path() -> PathBuf {
    let dir = std::env::var_os("U2NET_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".u2net")
        });
    dir.join("u2net.onnx")
}

fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

fn check_positive(s: &str) -> Result<usize, String> {
    let value: usize = s.parse().map_err(|e| format!("{s} is not a number: {e}"))?;
    if value == 0 {
        return Err("must be at least 1".to_string());
    }
    Ok(value)
}

fn check_sha256(s: &str) -> Result<String, String> {
    let digest = s.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("{s} is not a SHA-256 hex digest"));
    }
    Ok(digest)
}
