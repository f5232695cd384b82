//! # Transcription Runner
//!
//! Glue between the model cache and the HTTP layer: fetch (or load) the
//! requested model, run it over an audio file, and turn the model's
//! segments into the records the API returns.

use crate::transcription::cache::{ModelCache, ModelLoader};
use crate::transcription::error::WhisperResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Decoding settings applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Number of hypotheses kept during beam search.
    pub beam_size: usize,
    /// Skip non-speech regions before decoding.
    pub vad_filter: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            beam_size: 5,
            vad_filter: true,
        }
    }
}

/// One recognized span as produced by a model, before it gets an id.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    pub avg_logprob: f64,
    pub compression_ratio: f64,
    pub no_speech_prob: f64,
}

/// Call metadata reported next to the segments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptionInfo {
    pub language: Option<String>,
    /// Length of the decoded audio in seconds.
    pub duration: f64,
    /// Seconds of audio left after voice-activity filtering.
    pub duration_after_vad: f64,
}

/// Segments are produced lazily, one decoding window per step.
pub type SegmentStream<'a> = Box<dyn Iterator<Item = WhisperResult<RawSegment>> + 'a>;

/// A loaded model that can transcribe an audio file.
pub trait SpeechModel: Send + Sync {
    fn transcribe<'a>(
        &'a self,
        audio_path: &Path,
        options: &DecodeOptions,
    ) -> WhisperResult<(SegmentStream<'a>, TranscriptionInfo)>;
}

/// Segment record in the `/v1/audio/transcriptions` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub seek: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    pub temperature: f64,
    pub avg_logprob: f64,
    pub compression_ratio: f64,
    pub no_speech_prob: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
}

/// What the HTTP layer depends on. Blocking: call it off the async workers.
pub trait Transcriber: Send + Sync {
    /// Transcribe `audio_path` with the model named `model_name`, which
    /// must already be normalized.
    fn transcribe(&self, audio_path: &Path, model_name: &str) -> WhisperResult<Transcript>;

    /// Load `model_name` ahead of the first request.
    fn preload(&self, model_name: &str) -> WhisperResult<()>;
}

pub struct WhisperRunner<L: ModelLoader> {
    cache: ModelCache<L>,
    options: DecodeOptions,
}

impl<L: ModelLoader> WhisperRunner<L> {
    pub fn new(cache: ModelCache<L>, options: DecodeOptions) -> Self {
        Self { cache, options }
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ModelCache<L> {
        &self.cache
    }
}

impl<L> Transcriber for WhisperRunner<L>
where
    L: ModelLoader,
    L::Model: SpeechModel,
{
    fn transcribe(&self, audio_path: &Path, model_name: &str) -> WhisperResult<Transcript> {
        let model = self.cache.get_or_load(model_name)?;
        let (stream, info) = model.transcribe(audio_path, &self.options)?;

        debug!(
            model = %model_name,
            language = ?info.language,
            duration = info.duration,
            duration_after_vad = info.duration_after_vad,
            "Decoding audio"
        );

        collect_segments(stream)
    }

    fn preload(&self, model_name: &str) -> WhisperResult<()> {
        self.cache.get_or_load(model_name).map(|_| ())
    }
}

/// Number segments in order and assemble the full text.
///
/// Segment records keep the text exactly as decoded; the joined text uses
/// the trimmed, non-empty pieces.
pub fn collect_segments<I>(stream: I) -> WhisperResult<Transcript>
where
    I: IntoIterator<Item = WhisperResult<RawSegment>>,
{
    let mut segments = Vec::new();
    let mut pieces: Vec<String> = Vec::new();

    for (index, raw) in stream.into_iter().enumerate() {
        let raw = raw?;

        let trimmed = raw.text.trim();
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }

        segments.push(Segment {
            id: index,
            seek: 0,
            start: raw.start,
            end: raw.end,
            text: raw.text,
            tokens: raw.tokens,
            temperature: 0.0,
            avg_logprob: raw.avg_logprob,
            compression_ratio: raw.compression_ratio,
            no_speech_prob: raw.no_speech_prob,
        });
    }

    Ok(Transcript {
        text: pieces.join(" ").trim().to_string(),
        segments,
    })
}
