pub mod artifact;
pub mod config;
pub mod errors;
pub mod imageops_ai;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod server;
pub mod traits;

pub mod mocks;

pub use artifact::{ArtifactCache, ArtifactStatus, HttpFetcher, ModelArtifact};
pub use config::Config;
pub use errors::{ErrorKind, Result, RmbgError};
pub use model::Model;
pub use orchestrator::{ImageRequest, InferenceResult, RequestOrchestrator};
pub use pipeline::InferencePipeline;
pub use traits::*;

#[cfg(test)]
pub use mocks::*;
