//! # Audio Decoding
//!
//! Turns an uploaded audio file of any supported container/codec into the
//! 16 kHz mono `f32` PCM Whisper expects.
//!
//! ## Pipeline:
//! 1. Probe the container with symphonia (the file extension is passed as a hint)
//! 2. Decode every packet of the default track, skipping corrupt frames
//! 3. Downmix to mono by averaging channels
//! 4. Resample to 16 kHz with a windowed-sinc resampler if needed

use crate::transcription::error::{WhisperError, WhisperResult};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate every Whisper checkpoint is trained on.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

const RESAMPLE_CHUNK: usize = 1024;

/// Decode `path` to 16 kHz mono PCM.
pub fn decode_file(path: &Path) -> WhisperResult<Vec<f32>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| WhisperError::Audio(format!("probe: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| WhisperError::Audio("no audio track found".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_rate = codec_params
        .sample_rate
        .ok_or_else(|| WhisperError::Audio("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| WhisperError::Audio(format!("codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(WhisperError::Audio(format!("packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(WhisperError::Audio(format!("decode: {}", e))),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }

        let mut buffer = SampleBuffer::<f32>::new(frames as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        downmix_into(buffer.samples(), spec.channels.count(), &mut samples);
    }

    if samples.is_empty() {
        return Err(WhisperError::Audio("no audio samples decoded".to_string()));
    }

    if source_rate != TARGET_SAMPLE_RATE {
        samples = resample(&samples, source_rate, TARGET_SAMPLE_RATE)?;
    }

    tracing::debug!(
        samples = samples.len(),
        duration_secs = samples.len() as f32 / TARGET_SAMPLE_RATE as f32,
        source_rate,
        "Audio decoded to 16kHz mono PCM"
    );

    Ok(samples)
}

/// Append interleaved `samples` to `out`, averaging channels into one.
fn downmix_into(samples: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(samples);
        return;
    }
    out.extend(
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> WhisperResult<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| WhisperError::Audio(format!("resampler init: {}", e)))?;

    // The sinc filter delays its output; skip that many frames so sample
    // positions line up with the input.
    let delay = resampler.output_delay();
    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected_len + delay + RESAMPLE_CHUNK);

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK, 0.0);
        process_chunk(&mut resampler, input, &mut output)?;
    }

    // Flush the tail still held in the filter.
    while output.len() < delay + expected_len {
        let before = output.len();
        process_chunk(&mut resampler, vec![0.0; RESAMPLE_CHUNK], &mut output)?;
        if output.len() == before {
            break;
        }
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected_len);

    Ok(output)
}

fn process_chunk(
    resampler: &mut SincFixedIn<f32>,
    input: Vec<f32>,
    output: &mut Vec<f32>,
) -> WhisperResult<()> {
    let result = resampler
        .process(&[input], None)
        .map_err(|e| WhisperError::Audio(format!("resample: {}", e)))?;

    if let Some(channel) = result.first() {
        output.extend_from_slice(channel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    #[test]
    fn test_decode_mono_16k_wav() {
        let samples = decode_file(&fixture("test-speech.wav")).unwrap();

        // 0.5s silence, 1s tone, 0.5s silence
        assert_eq!(samples.len(), 32_000);
        assert!(samples[..8_000].iter().all(|s| s.abs() < 1e-4));
        let peak = samples[8_000..24_000]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.01, "peak was {}", peak);
    }

    #[test]
    fn test_decode_stereo_44k_is_resampled() {
        let samples = decode_file(&fixture("tone-44k-stereo.wav")).unwrap();
        assert_eq!(samples.len(), 16_000);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0], 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_garbage_input_is_an_audio_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not an mp3 stream").unwrap();

        let err = decode_file(&path).unwrap_err();
        assert!(matches!(err, WhisperError::Audio(_)));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = decode_file(Path::new("/nonexistent/upload.wav")).unwrap_err();
        assert!(matches!(err, WhisperError::Io(_)));
    }

    #[test]
    fn test_resample_keeps_edges_in_place() {
        // 0.1s of silence, then a constant level, at 44.1 kHz
        let mut input = vec![0.0f32; 4_410];
        input.extend(std::iter::repeat(0.5f32).take(39_690));

        let output = resample(&input, 44_100, 16_000).unwrap();

        assert_eq!(output.len(), 16_000);
        // The step belongs at sample 1600 of the 16 kHz output
        assert!(output[1_580].abs() < 0.05, "before edge: {}", output[1_580]);
        assert!((output[1_625] - 0.5).abs() < 0.05, "after edge: {}", output[1_625]);
        assert!((output[15_900] - 0.5).abs() < 0.05, "tail: {}", output[15_900]);
    }
}
