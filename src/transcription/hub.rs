//! # Model File Resolution
//!
//! Turns a canonical model name into the three files a Whisper checkpoint
//! needs (config, tokenizer, weights).
//!
//! ## Lookup Order:
//! 1. A name that is an existing directory is read from disk as-is
//! 2. Otherwise the name is mapped to a HuggingFace repository and the
//!    local hub cache is checked first
//! 3. Missing files are downloaded only when downloads are allowed
//!
//! Every "file is not there" failure is reported as an invalid-argument
//! load error whose message says the file "could not be found", so the
//! model cache can tell missing checkpoints apart from other failures.

use crate::transcription::error::LoadError;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Cache, Repo};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size names with published checkpoints, and the repository for each.
const KNOWN_MODELS: &[(&str, &str)] = &[
    ("tiny.en", "openai/whisper-tiny.en"),
    ("tiny", "openai/whisper-tiny"),
    ("base.en", "openai/whisper-base.en"),
    ("base", "openai/whisper-base"),
    ("small.en", "openai/whisper-small.en"),
    ("small", "openai/whisper-small"),
    ("medium.en", "openai/whisper-medium.en"),
    ("medium", "openai/whisper-medium"),
    ("large-v1", "openai/whisper-large"),
    ("large-v2", "openai/whisper-large-v2"),
    ("large-v3", "openai/whisper-large-v3"),
    ("large", "openai/whisper-large-v3"),
    ("large-v3-turbo", "openai/whisper-large-v3-turbo"),
    ("turbo", "openai/whisper-large-v3-turbo"),
    ("distil-small.en", "distil-whisper/distil-small.en"),
    ("distil-medium.en", "distil-whisper/distil-medium.en"),
    ("distil-large-v2", "distil-whisper/distil-large-v2"),
    ("distil-large-v3", "distil-whisper/distil-large-v3"),
];

/// Repository holding 8-bit GGUF exports of the Whisper checkpoints.
pub const QUANTIZED_REPO: &str = "lmz/candle-whisper";

/// Where a model's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A directory on disk with `config.json`, `tokenizer.json` and weights.
    Local(PathBuf),
    /// A HuggingFace repository id.
    Hub(String),
}

/// Paths of one resolved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

/// Map a canonical model name to where its files live.
pub fn resolve_source(name: &str) -> Result<ModelSource, LoadError> {
    let path = Path::new(name);
    if path.is_dir() {
        return Ok(ModelSource::Local(path.to_path_buf()));
    }

    if let Some((_, repo)) = KNOWN_MODELS
        .iter()
        .find(|(size, _)| size.eq_ignore_ascii_case(name))
    {
        return Ok(ModelSource::Hub(repo.to_string()));
    }

    if name.contains('/') {
        return Ok(ModelSource::Hub(name.to_string()));
    }

    let known: Vec<&str> = KNOWN_MODELS.iter().map(|(size, _)| *size).collect();
    Err(LoadError::invalid(format!(
        "Invalid model size '{}', expected one of: {}",
        name,
        known.join(", ")
    )))
}

/// File stem used by the GGUF exports: `tiny.en` is published as `tiny-en`.
pub fn quantized_stem(name: &str) -> String {
    let size = name.rsplit('/').next().unwrap_or(name);
    let size = size.strip_prefix("whisper-").unwrap_or(size);
    size.to_lowercase().replace('.', "-")
}

/// Settings for talking to the HuggingFace hub.
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// Overrides `HF_HUB_CACHE` / `HF_HOME`.
    pub cache_dir: Option<PathBuf>,
    /// When false only files already in the cache are used.
    pub allow_download: bool,
    pub token: Option<String>,
}

/// Fetches checkpoint files from the local cache or the hub.
#[derive(Debug, Clone)]
pub struct ModelHub {
    cache: Cache,
    options: HubOptions,
}

impl ModelHub {
    pub fn new(options: HubOptions) -> Self {
        let cache_dir = options.cache_dir.clone().or_else(|| {
            if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
                Some(PathBuf::from(cache_dir))
            } else if let Ok(hf_home) = std::env::var("HF_HOME") {
                Some(PathBuf::from(hf_home).join("hub"))
            } else {
                None
            }
        });

        let cache = match cache_dir {
            Some(dir) => Cache::new(dir),
            None => Cache::default(),
        };
        debug!(
            cache_dir = ?cache.path(),
            allow_download = options.allow_download,
            "Model hub configured"
        );

        Self { cache, options }
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    /// Resolve the full-precision checkpoint for `name`.
    pub fn full_precision(&self, name: &str) -> Result<ModelFiles, LoadError> {
        match resolve_source(name)? {
            ModelSource::Local(dir) => Ok(ModelFiles {
                config: local_file(&dir, "config.json")?,
                tokenizer: local_file(&dir, "tokenizer.json")?,
                weights: local_file(&dir, "model.safetensors")?,
            }),
            ModelSource::Hub(repo) => Ok(ModelFiles {
                config: self.fetch(&repo, "config.json")?,
                tokenizer: self.fetch(&repo, "tokenizer.json")?,
                weights: self.fetch(&repo, "model.safetensors")?,
            }),
        }
    }

    /// Resolve the 8-bit GGUF checkpoint for `name`.
    pub fn quantized(&self, name: &str) -> Result<ModelFiles, LoadError> {
        match resolve_source(name)? {
            ModelSource::Local(dir) => Ok(ModelFiles {
                config: local_file(&dir, "config.json")?,
                tokenizer: local_file(&dir, "tokenizer.json")?,
                weights: local_file(&dir, "model.gguf")?,
            }),
            ModelSource::Hub(repo) => {
                let stem = quantized_stem(&repo);
                Ok(ModelFiles {
                    config: self.fetch(QUANTIZED_REPO, &format!("config-{}.json", stem))?,
                    tokenizer: self.fetch(QUANTIZED_REPO, &format!("tokenizer-{}.json", stem))?,
                    weights: self.fetch(QUANTIZED_REPO, &format!("model-{}-q80.gguf", stem))?,
                })
            }
        }
    }

    /// Local cache first, then the network if allowed.
    fn fetch(&self, repo: &str, filename: &str) -> Result<PathBuf, LoadError> {
        if let Some(path) = self.cache.repo(Repo::model(repo.to_string())).get(filename) {
            debug!(repo = %repo, file = %filename, path = ?path, "Using cached model file");
            return Ok(path);
        }

        if !self.options.allow_download {
            return Err(LoadError::invalid(format!(
                "{} for '{}' could not be found in the local cache at {}",
                filename,
                repo,
                self.cache.path().display()
            )));
        }

        info!(repo = %repo, file = %filename, "Downloading model file");
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache.path().clone())
            .with_token(self.options.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| {
                LoadError::Fatal(anyhow::anyhow!("failed to create HuggingFace client: {}", e))
            })?;

        api.model(repo.to_string()).get(filename).map_err(|e| {
            LoadError::invalid(format!(
                "{} for '{}' could not be found: {}",
                filename, repo, e
            ))
        })
    }
}

fn local_file(dir: &Path, filename: &str) -> Result<PathBuf, LoadError> {
    let path = dir.join(filename);
    if path.is_file() {
        Ok(path)
    } else {
        Err(LoadError::invalid(format!(
            "{} could not be found in {}",
            filename,
            dir.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::cache::is_missing_model_error;
    use std::fs;

    /// Lay out `files` the way the hub cache stores a snapshot.
    fn seed_cache(root: &Path, repo: &str, files: &[&str]) {
        let repo_dir = root.join(format!("models--{}", repo.replace('/', "--")));
        let commit = "0123456789abcdef";
        fs::create_dir_all(repo_dir.join("refs")).unwrap();
        fs::write(repo_dir.join("refs").join("main"), commit).unwrap();

        let snapshot = repo_dir.join("snapshots").join(commit);
        fs::create_dir_all(&snapshot).unwrap();
        for file in files {
            fs::write(snapshot.join(file), b"{}").unwrap();
        }
    }

    fn offline_hub(root: &Path) -> ModelHub {
        ModelHub::new(HubOptions {
            cache_dir: Some(root.to_path_buf()),
            allow_download: false,
            token: None,
        })
    }

    #[test]
    fn test_standard_sizes_map_to_repositories() {
        assert_eq!(resolve_source("base").unwrap(), ModelSource::Hub("openai/whisper-base".into()));
        assert_eq!(
            resolve_source("small.en").unwrap(),
            ModelSource::Hub("openai/whisper-small.en".into())
        );
        assert_eq!(
            resolve_source("large-v3").unwrap(),
            ModelSource::Hub("openai/whisper-large-v3".into())
        );
        assert_eq!(
            resolve_source("distil-large-v3").unwrap(),
            ModelSource::Hub("distil-whisper/distil-large-v3".into())
        );
    }

    #[test]
    fn test_repository_ids_pass_through() {
        assert_eq!(
            resolve_source("my-org/whisper-finetuned").unwrap(),
            ModelSource::Hub("my-org/whisper-finetuned".into())
        );
    }

    #[test]
    fn test_unknown_size_is_invalid_but_not_missing() {
        let err = resolve_source("gigantic").unwrap_err();
        assert!(matches!(err, LoadError::InvalidArgument(_)));
        assert!(err.to_string().contains("'gigantic'"));
        assert!(!is_missing_model_error(&err));
    }

    #[test]
    fn test_local_directory_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["config.json", "tokenizer.json", "model.safetensors"] {
            fs::write(dir.path().join(file), b"{}").unwrap();
        }
        let name = dir.path().to_str().unwrap();

        let hub = offline_hub(dir.path());
        let files = hub.full_precision(name).unwrap();
        assert_eq!(files.weights, dir.path().join("model.safetensors"));

        let err = hub.quantized(name).unwrap_err();
        assert!(is_missing_model_error(&err));
    }

    #[test]
    fn test_cached_snapshot_resolves_offline() {
        let root = tempfile::tempdir().unwrap();
        seed_cache(
            root.path(),
            "openai/whisper-tiny",
            &["config.json", "tokenizer.json", "model.safetensors"],
        );

        let files = offline_hub(root.path()).full_precision("tiny").unwrap();
        assert!(files.config.ends_with("config.json"));
        assert!(files.weights.ends_with("model.safetensors"));
        assert!(files.weights.is_file());
    }

    #[test]
    fn test_cache_miss_offline_is_a_missing_model_error() {
        let root = tempfile::tempdir().unwrap();
        seed_cache(root.path(), "openai/whisper-base", &["config.json"]);

        let err = offline_hub(root.path()).full_precision("base").unwrap_err();

        assert!(matches!(err, LoadError::InvalidArgument(_)));
        assert!(err.to_string().contains("tokenizer.json"));
        assert!(is_missing_model_error(&err));
    }

    #[test]
    fn test_quantized_files_use_dashed_stems() {
        assert_eq!(quantized_stem("openai/whisper-tiny.en"), "tiny-en");
        assert_eq!(quantized_stem("openai/whisper-base"), "base");

        let root = tempfile::tempdir().unwrap();
        seed_cache(
            root.path(),
            QUANTIZED_REPO,
            &["config-tiny-en.json", "tokenizer-tiny-en.json", "model-tiny-en-q80.gguf"],
        );

        let files = offline_hub(root.path()).quantized("tiny.en").unwrap();
        assert!(files.weights.ends_with("model-tiny-en-q80.gguf"));
    }
}
