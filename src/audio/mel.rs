//! Mel filter bank for Whisper's log-mel front end.
//!
//! Whisper was trained on features computed with librosa's Slaney-style
//! filter bank (`librosa.filters.mel(sr=16000, n_fft=400, n_mels=...)`).
//! The bank is small, so it is computed at load time instead of being
//! shipped as a binary blob.

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Row-major `(n_mels, n_fft / 2 + 1)` filter bank, area-normalized.
pub fn mel_filters(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_max = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (lower_hz, center_hz, upper_hz) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (upper_hz - lower_hz);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower_hz) / (center_hz - lower_hz);
            let falling = (upper_hz - freq) / (upper_hz - center_hz);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_round_trips_across_the_log_boundary() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_filter_bank_shape_and_coverage() {
        let filters = mel_filters(16_000, 400, 80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));

        for m in 0..80 {
            let row = &filters[m * 201..(m + 1) * 201];
            assert!(row.iter().any(|w| *w > 0.0), "mel band {} is empty", m);
        }
    }

    #[test]
    fn test_first_band_matches_librosa() {
        // librosa.filters.mel(sr=16000, n_fft=400, n_mels=80)[0, 1]
        let filters = mel_filters(16_000, 400, 80);
        assert!((filters[1] - 0.024_862_06).abs() < 1e-4, "got {}", filters[1]);
        assert_eq!(filters[0], 0.0);
    }

    #[test]
    fn test_large_v3_uses_128_bands() {
        let filters = mel_filters(16_000, 400, 128);
        assert_eq!(filters.len(), 128 * 201);
    }
}
