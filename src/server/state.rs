use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::rate_limit::RateLimiter;
use crate::transcode::Transcoder;
use crate::tts::{InvokerOptions, ModelRegistry};

/// Shared, read-only state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub transcoder: Arc<Transcoder>,
    pub limiter: Arc<RateLimiter>,
    pub invoker: InvokerOptions,
    pub shutdown: CancellationToken, // Root token; each session runs under a child of it
}

impl AppState {
    pub fn new(registry: ModelRegistry, transcoder: Transcoder, limiter: Arc<RateLimiter>, invoker: InvokerOptions, shutdown: CancellationToken) -> Self {
        Self { registry: Arc::new(registry), transcoder: Arc::new(transcoder), limiter, invoker, shutdown }
    }
}
