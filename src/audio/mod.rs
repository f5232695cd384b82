//! # Audio Front End
//!
//! Everything between an uploaded file and the model's input features.
//!
//! ## Key Components:
//! - **Decoder**: any supported container/codec to 16 kHz mono `f32` PCM
//! - **Mel**: the Slaney mel filter bank Whisper's log-mel features use
//! - **VAD**: energy-based speech detection to skip silence
//!
//! ## Audio Format After Decoding:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (channels averaged)
//! - **Samples**: `f32` in `[-1.0, 1.0]`

pub mod decoder;
pub mod mel;
pub mod vad;

pub use decoder::{decode_file, TARGET_SAMPLE_RATE};
pub use mel::mel_filters;
pub use vad::{detect_speech, split_spans, SpeechSpan, VadOptions};
