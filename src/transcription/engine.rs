//! # Transcription Engine
//!
//! Decoding side of a loaded Whisper model: log-mel features, language
//! detection, and beam search over one audio window at a time.
//!
//! ## Windows:
//! Audio is cut into spans of at most 30 seconds (the encoder's context).
//! Each span is encoded once and decoded without timestamps, so one span
//! becomes exactly one segment. Segments are produced lazily through
//! [`SegmentIter`], which holds the model lock until it is dropped.
//!
//! ## Beam Search:
//! Every live hypothesis proposes its `beam_size + 1` best next tokens.
//! Candidates are ranked by cumulative log-probability; those ending in
//! end-of-text are set aside as finished, the best `beam_size` others stay
//! live. Decoding stops once `beam_size` hypotheses have finished or after
//! half the text context. The winner is picked by length-normalized score.

use crate::audio::{SpeechSpan, TARGET_SAMPLE_RATE};
use crate::transcription::error::{WhisperError, WhisperResult};
use crate::transcription::model::ModelKind;
use crate::transcription::runner::RawSegment;
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::models::whisper::{self as m, Config};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::sync::MutexGuard;
use tokenizers::Tokenizer;
use tracing::debug;

/// Language codes in the order of their tokens, starting right after
/// `<|startoftranscript|>`.
pub const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

/// Multilingual checkpoints carry the full language token block.
const MULTILINGUAL_VOCAB_SIZE: usize = 51_865;

/// Ids of the control tokens the decoder needs, read from the tokenizer.
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    pub sot: u32,
    pub eot: u32,
    pub transcribe: u32,
    pub no_timestamps: u32,
    pub no_speech: Option<u32>,
    /// The lone space token, suppressed at the first step.
    pub blank: Option<u32>,
    pub languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> WhisperResult<Self> {
        let required = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| WhisperError::Tokenizer(format!("missing special token {}", token)))
        };

        let no_speech = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));

        let languages = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();

        Ok(Self {
            sot: required(m::SOT_TOKEN)?,
            eot: required(m::EOT_TOKEN)?,
            transcribe: required(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: required(m::NO_TIMESTAMPS_TOKEN)?,
            no_speech,
            blank: tokenizer.token_to_id("Ġ"),
            languages,
        })
    }
}

/// Everything about a loaded model that decoding reads but never mutates.
pub struct DecodeContext {
    pub config: Config,
    pub device: Device,
    /// Dtype the encoder expects its input features in.
    pub dtype: DType,
    pub tokenizer: Tokenizer,
    pub mel_filters: Vec<f32>,
    pub tokens: SpecialTokens,
    suppress: Tensor,
    suppress_initial: Tensor,
}

impl DecodeContext {
    pub fn new(
        config: Config,
        device: Device,
        dtype: DType,
        tokenizer: Tokenizer,
        mel_filters: Vec<f32>,
    ) -> WhisperResult<Self> {
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        // Without timestamps every control and timestamp token sits at or
        // above <|startoftranscript|>; end-of-text sits just below it.
        let suppressed = |id: u32| id >= tokens.sot || config.suppress_tokens.contains(&id);
        let mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|id| if suppressed(id) { f32::NEG_INFINITY } else { 0.0 })
            .collect();
        let initial_mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|id| {
                if suppressed(id) || id == tokens.eot || Some(id) == tokens.blank {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();

        let suppress = Tensor::new(mask.as_slice(), &device)?;
        let suppress_initial = Tensor::new(initial_mask.as_slice(), &device)?;

        Ok(Self {
            config,
            device,
            dtype,
            tokenizer,
            mel_filters,
            tokens,
            suppress,
            suppress_initial,
        })
    }

    pub fn is_multilingual(&self) -> bool {
        self.config.vocab_size >= MULTILINGUAL_VOCAB_SIZE
    }

    /// Decoder prompt for a window, given the detected language token.
    pub fn prompt(&self, language: Option<u32>) -> Vec<u32> {
        let mut prompt = vec![self.tokens.sot];
        if self.is_multilingual() {
            if let Some(language) = language {
                prompt.push(language);
            }
            prompt.push(self.tokens.transcribe);
        }
        prompt.push(self.tokens.no_timestamps);
        prompt
    }

    /// Log-mel features of up to 30 s of audio, zero padded to a full window.
    fn log_mel(&self, samples: &[f32]) -> WhisperResult<Tensor> {
        let mut padded = samples.to_vec();
        padded.resize(m::N_SAMPLES.max(samples.len()), 0.0);

        let mel = m::audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?
            .narrow(2, 0, m::N_FRAMES.min(frames))?
            .to_dtype(self.dtype)?;
        Ok(mel)
    }

    pub fn encode(&self, model: &mut ModelKind, samples: &[f32]) -> WhisperResult<Tensor> {
        let mel = self.log_mel(samples)?;
        Ok(model.encoder_forward(&mel, true)?)
    }

    /// Most likely language for already encoded audio.
    pub fn detect_language(
        &self,
        model: &mut ModelKind,
        audio_features: &Tensor,
    ) -> WhisperResult<(&'static str, u32)> {
        let tokens = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let hidden = model.decoder_forward(&tokens, audio_features, true)?;
        let logits: Vec<f32> = model
            .decoder_final_linear(&hidden.narrow(1, 0, 1)?)?
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        self.tokens
            .languages
            .iter()
            .filter_map(|(code, id)| logits.get(*id as usize).map(|logit| (*code, *id, *logit)))
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(code, id, _)| (code, id))
            .ok_or_else(|| WhisperError::Tokenizer("tokenizer has no language tokens".to_string()))
    }

    /// Beam-search one encoded window.
    fn decode(
        &self,
        model: &mut ModelKind,
        audio_features: &Tensor,
        prompt: &[u32],
        beam_size: usize,
    ) -> WhisperResult<Hypothesis> {
        let beam_size = beam_size.max(1);
        let features = audio_features.repeat((beam_size, 1, 1))?;
        let max_steps = self.config.max_target_positions / 2;

        let mut search = BeamSearch::new(beam_size, self.tokens.eot);
        let mut no_speech_prob = 0.0;
        let mut previous_batch = 0;

        for step in 0..max_steps {
            let batch = search.live.len();
            let sequences: Vec<u32> = search
                .live
                .iter()
                .flat_map(|hypothesis| prompt.iter().chain(hypothesis.tokens.iter()).copied())
                .collect();
            let seq_len = sequences.len() / batch;
            if seq_len > self.config.max_target_positions {
                break;
            }

            let tokens = Tensor::from_vec(sequences, (batch, seq_len), &self.device)?;
            let xa = features.narrow(0, 0, batch)?;
            let hidden = model.decoder_forward(&tokens, &xa, step == 0 || batch != previous_batch)?;
            previous_batch = batch;

            if step == 0 {
                no_speech_prob = self.no_speech_prob(model, &hidden)?;
            }

            let last = hidden.narrow(1, seq_len - 1, 1)?;
            let logits = model
                .decoder_final_linear(&last)?
                .squeeze(1)?
                .to_dtype(DType::F32)?;
            let mask = if step == 0 {
                &self.suppress_initial
            } else {
                &self.suppress
            };
            let logprobs = candle_nn::ops::log_softmax(&logits.broadcast_add(mask)?, D::Minus1)?;
            let rows: Vec<Vec<f32>> = logprobs.to_vec2()?;

            if search.step(&rows) {
                break;
            }
        }

        let mut best = search.finish();
        best.no_speech_prob = no_speech_prob;
        Ok(best)
    }

    /// Probability of the no-speech token at the start-of-transcript position.
    fn no_speech_prob(&self, model: &ModelKind, hidden: &Tensor) -> WhisperResult<f64> {
        let Some(no_speech) = self.tokens.no_speech else {
            return Ok(0.0);
        };
        let logits = model
            .decoder_final_linear(&hidden.narrow(0, 0, 1)?.narrow(1, 0, 1)?)?
            .flatten_all()?
            .to_dtype(DType::F32)?;
        let probs = candle_nn::ops::softmax(&logits, 0)?;
        Ok(probs.get(no_speech as usize)?.to_scalar::<f32>()? as f64)
    }
}

/// One decoded token sequence, without prompt or end-of-text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Hypothesis {
    pub tokens: Vec<u32>,
    pub sum_logprob: f64,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    sum_logprob: f64,
}

pub(crate) struct BeamSearch {
    beam_size: usize,
    eot: u32,
    live: Vec<Beam>,
    finished: Vec<Beam>,
}

impl BeamSearch {
    pub fn new(beam_size: usize, eot: u32) -> Self {
        let beam_size = beam_size.max(1);
        Self {
            beam_size,
            eot,
            live: vec![
                Beam {
                    tokens: Vec::new(),
                    sum_logprob: 0.0,
                };
                beam_size
            ],
            finished: Vec::new(),
        }
    }

    /// Advance every live beam with its row of log-probabilities.
    /// Returns true once enough hypotheses have finished.
    pub fn step(&mut self, logprobs: &[Vec<f32>]) -> bool {
        let mut candidates: Vec<Beam> = Vec::new();
        let mut index: HashMap<Vec<u32>, usize> = HashMap::new();

        for (beam, row) in self.live.iter().zip(logprobs) {
            for (token, logprob) in top_k(row, self.beam_size + 1) {
                let mut tokens = beam.tokens.clone();
                tokens.push(token);
                let sum_logprob = beam.sum_logprob + logprob as f64;

                match index.get(&tokens) {
                    Some(&i) => candidates[i].sum_logprob = sum_logprob,
                    None => {
                        index.insert(tokens.clone(), candidates.len());
                        candidates.push(Beam { tokens, sum_logprob });
                    }
                }
            }
        }

        candidates.sort_by(|a, b| b.sum_logprob.total_cmp(&a.sum_logprob));

        let mut live = Vec::with_capacity(self.beam_size);
        let mut newly_finished = Vec::new();
        for candidate in candidates {
            if candidate.tokens.last() == Some(&self.eot) {
                newly_finished.push(candidate);
            } else {
                live.push(candidate);
                if live.len() == self.beam_size {
                    break;
                }
            }
        }

        for candidate in newly_finished {
            if self.finished.len() >= self.beam_size {
                break;
            }
            if !self.finished.iter().any(|f| f.tokens == candidate.tokens) {
                self.finished.push(candidate);
            }
        }

        if !live.is_empty() {
            self.live = live;
        }
        self.finished.len() >= self.beam_size || self.live.is_empty()
    }

    /// Pick the best hypothesis, topping up with live beams if too few
    /// finished.
    pub fn finish(mut self) -> Hypothesis {
        if self.finished.len() < self.beam_size {
            let mut live = std::mem::take(&mut self.live);
            live.sort_by(|a, b| b.sum_logprob.total_cmp(&a.sum_logprob));
            let missing = self.beam_size - self.finished.len();
            self.finished.extend(live.into_iter().take(missing));
        }

        let eot = self.eot;
        self.finished
            .into_iter()
            .map(|mut beam| {
                if beam.tokens.last() == Some(&eot) {
                    beam.tokens.pop();
                }
                beam
            })
            .map(|beam| {
                let score = beam.sum_logprob / beam.tokens.len().max(1) as f64;
                (score, beam)
            })
            .fold(None::<(f64, Beam)>, |best, (score, beam)| match best {
                Some((best_score, _)) if best_score >= score => best,
                _ => Some((score, beam)),
            })
            .map(|(_, beam)| Hypothesis {
                avg_logprob: beam.sum_logprob / (beam.tokens.len() + 1) as f64,
                sum_logprob: beam.sum_logprob,
                tokens: beam.tokens,
                no_speech_prob: 0.0,
            })
            .unwrap_or(Hypothesis {
                tokens: Vec::new(),
                sum_logprob: 0.0,
                avg_logprob: 0.0,
                no_speech_prob: 0.0,
            })
    }
}

/// The `k` highest finite entries of `row`, best first; ties go to the
/// lower token id.
fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut best: Vec<(u32, f32)> = Vec::with_capacity(k + 1);
    for (token, &logprob) in row.iter().enumerate() {
        if !logprob.is_finite() {
            continue;
        }
        if best.len() == k && best.last().is_some_and(|(_, worst)| *worst >= logprob) {
            continue;
        }
        let at = best
            .iter()
            .position(|(_, value)| *value < logprob)
            .unwrap_or(best.len());
        best.insert(at, (token as u32, logprob));
        best.truncate(k);
    }
    best
}

/// Ratio of the UTF-8 length of `text` to its zlib-compressed length.
pub fn compression_ratio(text: &str) -> f64 {
    let bytes = text.as_bytes();
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    let compressed = encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .unwrap_or_default();

    if compressed.is_empty() {
        return 0.0;
    }
    bytes.len() as f64 / compressed.len() as f64
}

/// Lazily decodes one window per call to `next`.
pub struct SegmentIter<'a> {
    model: MutexGuard<'a, ModelKind>,
    context: &'a DecodeContext,
    samples: Vec<f32>,
    windows: std::vec::IntoIter<SpeechSpan>,
    prompt: Vec<u32>,
    beam_size: usize,
    /// Features of the first window, already computed for language detection.
    pending_features: Option<Tensor>,
}

impl<'a> SegmentIter<'a> {
    pub fn new(
        model: MutexGuard<'a, ModelKind>,
        context: &'a DecodeContext,
        samples: Vec<f32>,
        windows: Vec<SpeechSpan>,
        prompt: Vec<u32>,
        beam_size: usize,
        pending_features: Option<Tensor>,
    ) -> Self {
        Self {
            model,
            context,
            samples,
            windows: windows.into_iter(),
            prompt,
            beam_size,
            pending_features,
        }
    }

    fn decode_window(&mut self, window: SpeechSpan) -> WhisperResult<RawSegment> {
        let features = match self.pending_features.take() {
            Some(features) => features,
            None => self
                .context
                .encode(&mut self.model, &self.samples[window.start..window.end])?,
        };

        let hypothesis = self
            .context
            .decode(&mut self.model, &features, &self.prompt, self.beam_size)?;

        let text = self
            .context
            .tokenizer
            .decode(&hypothesis.tokens, true)
            .map_err(|e| WhisperError::Tokenizer(e.to_string()))?;

        let rate = TARGET_SAMPLE_RATE as f64;
        debug!(
            start = window.start as f64 / rate,
            end = window.end as f64 / rate,
            tokens = hypothesis.tokens.len(),
            avg_logprob = hypothesis.avg_logprob,
            "Decoded window"
        );

        Ok(RawSegment {
            start: window.start as f64 / rate,
            end: window.end as f64 / rate,
            compression_ratio: compression_ratio(&text),
            text,
            tokens: hypothesis.tokens,
            avg_logprob: hypothesis.avg_logprob,
            no_speech_prob: hypothesis.no_speech_prob,
        })
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = WhisperResult<RawSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        let window = self.windows.next()?;
        Some(self.decode_window(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: u32 = 3;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_top_k_orders_and_skips_suppressed() {
        let row = [-1.0, f32::NEG_INFINITY, -0.5, -1.0, -3.0];
        assert_eq!(top_k(&row, 3), vec![(2, -0.5), (0, -1.0), (3, -1.0)]);
        assert_eq!(top_k(&row, 10).len(), 4);
    }

    #[test]
    fn test_beam_search_prefers_length_normalized_score() {
        let mut search = BeamSearch::new(2, EOT);

        // Both beams start identical, so candidates collapse to one set.
        let first = vec![-0.5, -0.7, -3.0, -2.0];
        assert!(!search.step(&[first.clone(), first]));

        // [0] ends right away; [1] continues with 0.
        assert!(!search.step(&[vec![-3.0, -3.0, -3.0, -0.1], vec![-0.05, -5.0, -5.0, -6.0]]));

        let closing = vec![-5.0, -5.0, -5.0, -0.05];
        assert!(search.step(&[closing.clone(), closing]));

        let best = search.finish();
        // [0] scores -0.6 / 1, [1, 0] scores -0.8 / 2
        assert_eq!(best.tokens, vec![1, 0]);
        assert!(close(best.sum_logprob, -0.8));
        assert!(close(best.avg_logprob, -0.8 / 3.0));
    }

    #[test]
    fn test_unfinished_search_falls_back_to_live_beams() {
        let mut search = BeamSearch::new(2, EOT);
        let row = vec![-0.1, -2.0, -4.0, f32::NEG_INFINITY];
        for _ in 0..3 {
            assert!(!search.step(&[row.clone(), row.clone()]));
        }

        let best = search.finish();
        assert_eq!(best.tokens, vec![0, 0, 0]);
        assert!(close(best.avg_logprob, -0.3 / 4.0));
    }

    #[test]
    fn test_beam_of_one_is_greedy() {
        let mut search = BeamSearch::new(1, EOT);
        search.step(&[vec![-0.2, -1.0, -2.0, -3.0]]);
        assert!(search.step(&[vec![-2.0, -1.0, -2.0, -0.3]]));

        let best = search.finish();
        assert_eq!(best.tokens, vec![0]);
        assert!(close(best.sum_logprob, -0.5));
    }

    #[test]
    fn test_compression_ratio_of_repetitive_text_is_high() {
        let repetitive = "the same words again and again ".repeat(20);
        assert!(compression_ratio(&repetitive) > 2.4);

        let ordinary = " The quick brown fox jumps over the lazy dog.";
        let ratio = compression_ratio(ordinary);
        assert!(ratio > 0.5 && ratio < 1.5, "ratio was {}", ratio);
    }

    #[test]
    fn test_compression_ratio_of_empty_text_is_zero() {
        assert_eq!(compression_ratio(""), 0.0);
    }
}
