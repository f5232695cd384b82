//! # Configuration Management
//!
//! This module loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between sections)
//! - Well-known deployment variables (HOST, PORT, LOCAL_WHISPER_*)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. HOST, PORT, LOCAL_WHISPER_MODEL, LOCAL_WHISPER_DEVICE,
//!    LOCAL_WHISPER_COMPUTE_TYPE, LOCAL_WHISPER_BEAM_SIZE
//! 2. Environment variables (APP_SERVER__PORT, APP_WHISPER__BEAM_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub whisper: WhisperConfig,
    pub upload: UploadConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Whisper model selection and decoding settings.
///
/// ## Fields:
/// - `default_model`: Model used when a request names none ("base", "large-v3",
///   a repo id, a directory)
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `compute_type`: "auto", "float32", "float16", "bfloat16", "int8", "int8_float32", ...
/// - `beam_size`: Hypotheses kept during beam search
/// - `vad_filter`: Skip silence before decoding
/// - `allow_download`: Fetch missing model files from the HuggingFace hub
/// - `cache_dir`: HuggingFace cache location (defaults to HF_HUB_CACHE / HF_HOME)
/// - `preload`: Load the default model at startup instead of on first request
/// - `aliases`: Extra name mappings applied on top of the built-in ones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    pub default_model: String,
    pub device: String,
    pub compute_type: String,
    pub beam_size: usize,
    pub vad_filter: bool,
    pub allow_download: bool,
    pub cache_dir: Option<String>,
    pub preload: bool,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted upload, in megabytes.
    pub max_size_mb: usize,
}

impl UploadConfig {
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            whisper: WhisperConfig {
                default_model: "large-v3-turbo".to_string(),
                device: "auto".to_string(),
                compute_type: "auto".to_string(),
                beam_size: 5,
                vad_filter: true,
                allow_download: true,
                cache_dir: None,
                preload: false,
                aliases: HashMap::new(),
            },
            upload: UploadConfig { max_size_mb: 50 },
        }
    }
}

/// Deployment variables that override any other source, and the key each one sets.
const OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("LOCAL_WHISPER_MODEL", "whisper.default_model"),
    ("LOCAL_WHISPER_DEVICE", "whisper.device"),
    ("LOCAL_WHISPER_COMPUTE_TYPE", "whisper.compute_type"),
];

impl AppConfig {
    /// Load configuration from `config.toml` in the working directory and
    /// the environment.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration with `file` (extension optional) as the file layer.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_WHISPER__DEFAULT_MODEL=small`: Override the default model
    /// - `APP_UPLOAD__MAX_SIZE_MB=200`: Raise the upload limit
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `LOCAL_WHISPER_BEAM_SIZE=1`: Greedy decoding
    pub fn load_from(file: &str) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        for (variable, key) in OVERRIDES {
            if let Ok(value) = env::var(variable) {
                settings = settings.set_override(*key, value)?;
            }
        }

        if let Ok(beam_size) = env::var("LOCAL_WHISPER_BEAM_SIZE") {
            let beam_size: i64 = beam_size.trim().parse().with_context(|| {
                format!("LOCAL_WHISPER_BEAM_SIZE must be an integer, got '{}'", beam_size)
            })?;
            settings = settings.set_override("whisper.beam_size", beam_size)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.whisper.beam_size == 0 {
            return Err(anyhow::anyhow!("Beam size must be greater than 0"));
        }

        if self.whisper.default_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Default Whisper model cannot be empty"));
        }

        if self.upload.max_size_mb == 0 {
            return Err(anyhow::anyhow!("Upload size limit must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.whisper.default_model, "large-v3-turbo");
        assert_eq!(config.whisper.device, "auto");
        assert_eq!(config.whisper.compute_type, "auto");
        assert_eq!(config.whisper.beam_size, 5);
        assert!(config.whisper.vad_filter);
        assert_eq!(config.upload.max_size_bytes(), 50 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.whisper.beam_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.whisper.default_model = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local-whisper.toml");
        std::fs::write(
            &path,
            r#"
[whisper]
vad_filter = false
preload = true

[whisper.aliases]
fast = "tiny.en"

[upload]
max_size_mb = 200
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(path.to_str().unwrap()).unwrap();

        assert!(!config.whisper.vad_filter);
        assert!(config.whisper.preload);
        assert_eq!(config.whisper.aliases.get("fast").map(String::as_str), Some("tiny.en"));
        assert_eq!(config.upload.max_size_mb, 200);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/local-whisper").unwrap();
        assert!(config.whisper.allow_download);
        assert!(config.whisper.cache_dir.is_none());
    }
}
