//! # Voice Activity Detection
//!
//! Frame-energy speech detector used to skip silence before decoding.
//! Each 30 ms frame is classified by its RMS level in dBFS; speech frames
//! are grouped into spans, short pauses inside speech are bridged, blips
//! are dropped, and every surviving span is padded so word onsets are
//! not clipped.

use super::decoder::TARGET_SAMPLE_RATE;

#[derive(Debug, Clone, PartialEq)]
pub struct VadOptions {
    /// Frames louder than this (dBFS) count as speech.
    pub threshold_dbfs: f32,
    pub frame_ms: u32,
    /// Speech runs shorter than this are discarded.
    pub min_speech_ms: u32,
    /// Pauses shorter than this do not split a span.
    pub min_silence_ms: u32,
    /// Audio kept on each side of a span.
    pub speech_pad_ms: u32,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            threshold_dbfs: -40.0,
            frame_ms: 30,
            min_speech_ms: 250,
            min_silence_ms: 2000,
            speech_pad_ms: 400,
        }
    }
}

/// Half-open range of sample indices, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSpan {
    pub start: usize,
    pub end: usize,
}

impl SpeechSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

fn ms_to_samples(ms: u32) -> usize {
    (TARGET_SAMPLE_RATE as usize * ms as usize) / 1000
}

fn frame_dbfs(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
    20.0 * mean_square.sqrt().max(1e-10).log10()
}

/// Find speech in 16 kHz mono `samples`.
pub fn detect_speech(samples: &[f32], options: &VadOptions) -> Vec<SpeechSpan> {
    let frame_len = ms_to_samples(options.frame_ms).max(1);
    let min_speech = ms_to_samples(options.min_speech_ms);
    let min_silence = ms_to_samples(options.min_silence_ms);
    let pad = ms_to_samples(options.speech_pad_ms);

    let mut runs: Vec<SpeechSpan> = Vec::new();
    for (index, frame) in samples.chunks(frame_len).enumerate() {
        if frame_dbfs(frame) < options.threshold_dbfs {
            continue;
        }
        let start = index * frame_len;
        let end = start + frame.len();
        match runs.last_mut() {
            Some(last) if start.saturating_sub(last.end) < min_silence => last.end = end,
            _ => runs.push(SpeechSpan { start, end }),
        }
    }

    let mut spans: Vec<SpeechSpan> = Vec::new();
    for run in runs.into_iter().filter(|run| run.len() >= min_speech) {
        let padded = SpeechSpan {
            start: run.start.saturating_sub(pad),
            end: (run.end + pad).min(samples.len()),
        };
        match spans.last_mut() {
            Some(last) if padded.start <= last.end => last.end = last.end.max(padded.end),
            _ => spans.push(padded),
        }
    }

    spans
}

/// Cut spans into pieces no longer than `max_len` samples.
pub fn split_spans(spans: &[SpeechSpan], max_len: usize) -> Vec<SpeechSpan> {
    let max_len = max_len.max(1);
    let mut pieces = Vec::new();
    for span in spans {
        let mut start = span.start;
        while start < span.end {
            let end = (start + max_len).min(span.end);
            pieces.push(SpeechSpan { start, end });
            start = end;
        }
    }
    pieces
}
