//! # Transcription Module
//!
//! Speech-to-text with Whisper checkpoints running on candle, in pure Rust.
//!
//! ## Key Components:
//! - **Normalizer**: request model names to canonical names (aliases, default)
//! - **Cache**: one loaded model per name, with compute-type fallback
//! - **Hub**: model files from a local directory, the hub cache, or a download
//! - **Model**: candle network construction and the per-file transcription entry point
//! - **Engine**: log-mel features, language detection, beam search
//! - **Runner**: turns a model's segments into API records and the full text
//!
//! ## Whisper Model Sizes:
//! - **tiny / tiny.en**: ~39M parameters, fastest
//! - **base / base.en**: ~74M parameters
//! - **small / small.en**: ~244M parameters
//! - **medium / medium.en**: ~769M parameters
//! - **large-v1 / large-v2 / large-v3**: ~1550M parameters, best accuracy
//! - **distil-***: distilled variants, decoder with two layers

pub mod cache;
pub mod engine;
pub mod error;
pub mod hub;
pub mod model;
pub mod normalizer;
pub mod runner;

pub use cache::ModelCache;
pub use error::WhisperError;
pub use hub::{HubOptions, ModelHub};
pub use model::CandleLoader;
pub use normalizer::ModelNameNormalizer;
pub use runner::{DecodeOptions, Segment, Transcriber, WhisperRunner};
