//! # Whisper Model Management
//!
//! Loads Whisper checkpoints with candle and exposes them as
//! [`SpeechModel`]s.
//!
//! ## Model Loading Process:
//! 1. Resolve the device and the compute type; reject combinations the
//!    backend cannot run (float16 on a CPU, unknown names)
//! 2. Locate config, tokenizer and weights (local cache, then download)
//! 3. Build the full-precision or 8-bit quantized network
//!
//! ## Compute Types:
//! - **auto**: float16 on a GPU, float32 on the CPU
//! - **float32 / float16 / bfloat16**: safetensors weights in that dtype
//! - **int8 / int8_float32 / int8_float16 / int8_bfloat16**: 8-bit GGUF
//!   weights; the float16 flavours are only accepted on a GPU
//!
//! ## Thread Safety:
//! The network keeps per-call decoder state, so it sits behind a mutex.
//! A transcription holds the lock for as long as its segment iterator is
//! alive; concurrent requests for the same model run one after another.

use crate::audio::{
    decode_file, detect_speech, mel_filters, split_spans, SpeechSpan, VadOptions,
    TARGET_SAMPLE_RATE,
};
use crate::device::{resolve_device, DeviceManager};
use crate::transcription::cache::ModelLoader;
use crate::transcription::engine::{DecodeContext, SegmentIter};
use crate::transcription::error::{LoadError, WhisperResult};
use crate::transcription::hub::{ModelFiles, ModelHub};
use crate::transcription::runner::{DecodeOptions, SegmentStream, SpeechModel, TranscriptionInfo};
use anyhow::anyhow;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use candle_transformers::quantized_var_builder;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokenizers::Tokenizer;

/// Precision a model is loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    Auto,
    Float32,
    Float16,
    BFloat16,
    Int8,
    Int8Float32,
    Int8Float16,
    Int8BFloat16,
}

impl ComputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeType::Auto => "auto",
            ComputeType::Float32 => "float32",
            ComputeType::Float16 => "float16",
            ComputeType::BFloat16 => "bfloat16",
            ComputeType::Int8 => "int8",
            ComputeType::Int8Float32 => "int8_float32",
            ComputeType::Int8Float16 => "int8_float16",
            ComputeType::Int8BFloat16 => "int8_bfloat16",
        }
    }

    /// How this compute type is realized on `device`.
    pub fn precision(&self, device: &Device) -> Result<Precision, LoadError> {
        let gpu = !device.is_cpu();
        match self {
            ComputeType::Auto if gpu => Ok(Precision::Full(DType::F16)),
            ComputeType::Auto | ComputeType::Float32 => Ok(Precision::Full(DType::F32)),
            ComputeType::Float16 if gpu => Ok(Precision::Full(DType::F16)),
            ComputeType::BFloat16 if gpu => Ok(Precision::Full(DType::BF16)),
            ComputeType::Int8 | ComputeType::Int8Float32 => Ok(Precision::Quantized),
            ComputeType::Int8Float16 | ComputeType::Int8BFloat16 if gpu => Ok(Precision::Quantized),
            ComputeType::Float16
            | ComputeType::BFloat16
            | ComputeType::Int8Float16
            | ComputeType::Int8BFloat16 => {
                let float = self.as_str().trim_start_matches("int8_");
                Err(LoadError::invalid(format!(
                    "Requested {} compute type, but the target device or backend do not support \
                     efficient {} computation.",
                    self.as_str(),
                    float
                )))
            }
        }
    }
}

impl FromStr for ComputeType {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "default" | "" => Ok(ComputeType::Auto),
            "float32" | "f32" => Ok(ComputeType::Float32),
            "float16" | "f16" => Ok(ComputeType::Float16),
            "bfloat16" | "bf16" => Ok(ComputeType::BFloat16),
            "int8" => Ok(ComputeType::Int8),
            "int8_float32" => Ok(ComputeType::Int8Float32),
            "int8_float16" => Ok(ComputeType::Int8Float16),
            "int8_bfloat16" => Ok(ComputeType::Int8BFloat16),
            _ => Err(LoadError::invalid(format!("unsupported compute type '{}'", s))),
        }
    }
}

impl fmt::Display for ComputeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full(DType),
    Quantized,
}

/// The two network flavours candle ships for Whisper.
pub enum ModelKind {
    Full(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl ModelKind {
    pub fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            ModelKind::Full(model) => model.encoder.forward(x, flush),
            ModelKind::Quantized(model) => model.encoder.forward(x, flush),
        }
    }

    pub fn decoder_forward(
        &mut self,
        x: &Tensor,
        xa: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            ModelKind::Full(model) => model.decoder.forward(x, xa, flush),
            ModelKind::Quantized(model) => model.decoder.forward(x, xa, flush),
        }
    }

    pub fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            ModelKind::Full(model) => model.decoder.final_linear(x),
            ModelKind::Quantized(model) => model.decoder.final_linear(x),
        }
    }
}

/// A loaded Whisper model ready for transcription.
pub struct WhisperModel {
    name: String,
    compute_type: ComputeType,
    context: DecodeContext,
    model: Mutex<ModelKind>,
}

impl WhisperModel {
    /// Build the network from resolved files.
    pub fn load(
        name: &str,
        files: &ModelFiles,
        device: Device,
        compute_type: ComputeType,
        precision: Precision,
    ) -> Result<Self, LoadError> {
        let start_time = Instant::now();

        let config_file = std::fs::File::open(&files.config).map_err(anyhow::Error::from)?;
        let config: Config = serde_json::from_reader(config_file)
            .map_err(|e| anyhow!("invalid model config {}: {}", files.config.display(), e))?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {}", files.tokenizer.display(), e))?;
        let filters = mel_filters(TARGET_SAMPLE_RATE, m::N_FFT, config.num_mel_bins);

        let (model, dtype) = match precision {
            Precision::Full(dtype) => {
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)
                        .map_err(anyhow::Error::from)?
                };
                let model =
                    m::model::Whisper::load(&vb, config.clone()).map_err(anyhow::Error::from)?;
                (ModelKind::Full(model), dtype)
            }
            Precision::Quantized => {
                let vb = quantized_var_builder::VarBuilder::from_gguf(&files.weights, &device)
                    .map_err(anyhow::Error::from)?;
                let model = m::quantized_model::Whisper::load(&vb, config.clone())
                    .map_err(anyhow::Error::from)?;
                (ModelKind::Quantized(model), DType::F32)
            }
        };

        let context = DecodeContext::new(config, device, dtype, tokenizer, filters)
            .map_err(|e| anyhow!("failed to prepare decoder for '{}': {}", name, e))?;

        tracing::info!(
            model = %name,
            compute_type = %compute_type,
            device = DeviceManager::get_device_info(&context.device),
            elapsed_secs = start_time.elapsed().as_secs_f64(),
            "Whisper model loaded"
        );

        Ok(Self {
            name: name.to_string(),
            compute_type,
            context,
            model: Mutex::new(model),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_type(&self) -> ComputeType {
        self.compute_type
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe<'a>(
        &'a self,
        audio_path: &Path,
        options: &DecodeOptions,
    ) -> WhisperResult<(SegmentStream<'a>, TranscriptionInfo)> {
        let samples = decode_file(audio_path)?;
        let rate = TARGET_SAMPLE_RATE as f64;

        let spans = if options.vad_filter {
            detect_speech(&samples, &VadOptions::default())
        } else if samples.is_empty() {
            Vec::new()
        } else {
            vec![SpeechSpan {
                start: 0,
                end: samples.len(),
            }]
        };
        let windows = split_spans(&spans, m::N_SAMPLES);

        let info_duration = samples.len() as f64 / rate;
        let duration_after_vad = windows.iter().map(|w| w.len()).sum::<usize>() as f64 / rate;
        tracing::debug!(
            model = %self.name(),
            compute_type = %self.compute_type(),
            windows = windows.len(),
            "Transcribing audio"
        );

        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);

        let (language, language_token, first_features) = if !self.context.is_multilingual() {
            (Some("en".to_string()), None, None)
        } else if let Some(first) = windows.first() {
            let features = self
                .context
                .encode(&mut model, &samples[first.start..first.end])?;
            let (code, token) = self.context.detect_language(&mut model, &features)?;
            tracing::debug!(model = %self.name, language = code, "Detected language");
            (Some(code.to_string()), Some(token), Some(features))
        } else {
            (None, None, None)
        };

        let info = TranscriptionInfo {
            language,
            duration: info_duration,
            duration_after_vad,
        };

        let prompt = self.context.prompt(language_token);
        let stream = SegmentIter::new(
            model,
            &self.context,
            samples,
            windows,
            prompt,
            options.beam_size,
            first_features,
        );

        Ok((Box::new(stream), info))
    }
}

/// Builds [`WhisperModel`]s for the model cache.
pub struct CandleLoader {
    hub: ModelHub,
}

impl CandleLoader {
    pub fn new(hub: ModelHub) -> Self {
        Self { hub }
    }
}

impl ModelLoader for CandleLoader {
    type Model = WhisperModel;

    fn load(
        &self,
        name: &str,
        device: &str,
        compute_type: &str,
    ) -> Result<WhisperModel, LoadError> {
        let device = resolve_device(device)?;
        let compute_type: ComputeType = compute_type.parse()?;
        let precision = compute_type.precision(&device)?;

        let files = match precision {
            Precision::Full(_) => self.hub.full_precision(name)?,
            Precision::Quantized => self.hub.quantized(name)?,
        };

        WhisperModel::load(name, &files, device, compute_type, precision)
    }
}
