//! # Application State Management
//!
//! Shared state handed to every request handler through `web::Data`.
//!
//! ## Contents:
//! - **config**: Read-only after startup, so a plain `Arc` is enough
//! - **normalizer**: Resolves request model names (default, aliases)
//! - **transcriber**: The transcription seam; production wires in the
//!   candle-backed runner, tests substitute a stub
//!
//! The only mutable shared data, the model cache, lives behind its own
//! mutex inside the transcriber.

use crate::config::AppConfig;
use crate::transcription::{ModelNameNormalizer, Transcriber};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub normalizer: Arc<ModelNameNormalizer>,
    pub transcriber: Arc<dyn Transcriber>,
}

impl AppState {
    /// Build state from configuration and a transcriber.
    ///
    /// The normalizer's default and extra aliases come from the `whisper`
    /// config section.
    pub fn new(config: AppConfig, transcriber: Arc<dyn Transcriber>) -> Self {
        let normalizer = ModelNameNormalizer::new(config.whisper.default_model.trim())
            .with_aliases(config.whisper.aliases.clone());

        Self {
            config: Arc::new(config),
            normalizer: Arc::new(normalizer),
            transcriber,
        }
    }
}
