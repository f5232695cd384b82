//! # Model Cache
//!
//! Keeps one loaded model per canonical name for the lifetime of the
//! process. Loading is expensive (seconds to minutes for the large
//! checkpoints), so the first request for a model pays for it and every
//! later request reuses the same handle.
//!
//! ## Locking:
//! A single mutex covers the whole lookup-or-load section. Only one load
//! can run at a time, and a request for an already cached model waits
//! while another model is being loaded. That also means two requests for
//! the same cold model never load it twice.
//!
//! ## Compute-type fallback:
//! Not every host accepts every precision (float16 needs a GPU, quantized
//! weights are not published for every size). The cache walks an ordered
//! list of compute types and keeps the first one the loader accepts.

use crate::transcription::error::{LoadError, WhisperError, WhisperResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Compute type used when none is configured.
pub const AUTO_COMPUTE_TYPE: &str = "auto";

/// Phrases that mark a loader failure as "model files are missing".
const MISSING_MODEL_PHRASES: &[&str] = &["not found", "no such file", "could not be found"];

/// Something that can build a model for a (name, device, compute type) triple.
pub trait ModelLoader: Send + Sync {
    type Model: Send + Sync;

    fn load(&self, name: &str, device: &str, compute_type: &str)
        -> Result<Self::Model, LoadError>;
}

/// Build the ordered compute types to try for one load.
///
/// The configured value comes first (blank means `auto`). A float16
/// request also tries the 8-bit variants before settling on `auto`,
/// which is always last. Duplicates are dropped, first occurrence wins.
pub fn compute_type_candidates(configured: &str) -> Vec<String> {
    let configured = match configured.trim() {
        "" => AUTO_COMPUTE_TYPE,
        value => value,
    };

    let mut candidates: Vec<String> = Vec::new();
    let mut add = |candidate: &str| {
        if !candidate.is_empty() && !candidates.iter().any(|c| c == candidate) {
            candidates.push(candidate.to_string());
        }
    };

    add(configured);
    if configured.eq_ignore_ascii_case("float16") {
        add("int8_float32");
        add("int8");
    }
    add(AUTO_COMPUTE_TYPE);

    candidates
}

/// Whether a loader failure means the model files are absent locally.
///
/// This matches on message text, so it is tied to the wording of the
/// loader's errors. Keep every such check in this one function.
pub fn is_missing_model_error(error: &LoadError) -> bool {
    let text = error.to_string().to_lowercase();
    MISSING_MODEL_PHRASES
        .iter()
        .any(|phrase| text.contains(phrase))
}

pub struct ModelCache<L: ModelLoader> {
    loader: L,
    device: String,
    compute_type: String,
    models: Mutex<HashMap<String, Arc<L::Model>>>,
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L, device: impl Into<String>, compute_type: impl Into<String>) -> Self {
        Self {
            loader,
            device: device.into(),
            compute_type: compute_type.into(),
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached model for `name`, loading it on first use.
    ///
    /// `name` must already be normalized.
    pub fn get_or_load(&self, name: &str) -> WhisperResult<Arc<L::Model>> {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(model) = models.get(name) {
            return Ok(Arc::clone(model));
        }

        let mut last_error: Option<LoadError> = None;
        for compute_type in compute_type_candidates(&self.compute_type) {
            info!(
                model = %name,
                device = %self.device,
                compute_type = %compute_type,
                "Loading Whisper model"
            );

            match self.loader.load(name, &self.device, &compute_type) {
                Ok(model) => {
                    let model = Arc::new(model);
                    models.insert(name.to_string(), Arc::clone(&model));
                    return Ok(model);
                }
                Err(LoadError::InvalidArgument(message)) => {
                    warn!(
                        model = %name,
                        compute_type = %compute_type,
                        error = %message,
                        "Failed to load Whisper model"
                    );
                    last_error = Some(LoadError::InvalidArgument(message));
                }
                Err(fatal) => return Err(fatal.into()),
            }
        }

        match last_error {
            Some(error) if is_missing_model_error(&error) => {
                Err(WhisperError::ModelUnavailable(format!(
                    "Unable to load Whisper model '{}' with any compute type. \
                     Model files are not available locally.",
                    name
                )))
            }
            Some(error) => Err(error.into()),
            None => Err(WhisperError::NoCandidates(name.to_string())),
        }
    }

    /// Drop every cached model.
    #[cfg(test)]
    pub fn clear(&self) {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn loader(&self) -> &L {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeModel {
        name: String,
        device: String,
        compute_type: String,
    }

    /// Records every attempt; fails with the configured error for the
    /// compute types listed in `rejects`.
    struct FakeLoader {
        attempts: Mutex<Vec<String>>,
        rejects: Vec<(&'static str, fn() -> LoadError)>,
    }

    impl FakeLoader {
        fn new() -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                rejects: Vec::new(),
            }
        }

        fn reject(mut self, compute_type: &'static str, make_error: fn() -> LoadError) -> Self {
            self.rejects.push((compute_type, make_error));
            self
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl ModelLoader for FakeLoader {
        type Model = FakeModel;

        fn load(
            &self,
            name: &str,
            device: &str,
            compute_type: &str,
        ) -> Result<FakeModel, LoadError> {
            self.attempts.lock().unwrap().push(compute_type.to_string());
            if let Some((_, make_error)) = self.rejects.iter().find(|(ct, _)| *ct == compute_type) {
                return Err(make_error());
            }
            Ok(FakeModel {
                name: name.to_string(),
                device: device.to_string(),
                compute_type: compute_type.to_string(),
            })
        }
    }

    fn unsupported() -> LoadError {
        LoadError::invalid("float16 unsupported")
    }

    fn missing() -> LoadError {
        LoadError::invalid(
            "config.json for 'openai/whisper-base' could not be found in the local cache",
        )
    }

    #[test]
    fn test_candidates_for_auto_and_blank() {
        assert_eq!(compute_type_candidates("auto"), vec!["auto"]);
        assert_eq!(compute_type_candidates(""), vec!["auto"]);
        assert_eq!(compute_type_candidates("   "), vec!["auto"]);
    }

    #[test]
    fn test_candidates_for_float16_add_int8_fallbacks() {
        assert_eq!(
            compute_type_candidates("float16"),
            vec!["float16", "int8_float32", "int8", "auto"]
        );
        assert_eq!(
            compute_type_candidates("FLOAT16"),
            vec!["FLOAT16", "int8_float32", "int8", "auto"]
        );
    }

    #[test]
    fn test_candidates_for_other_types() {
        assert_eq!(compute_type_candidates("int8"), vec!["int8", "auto"]);
        assert_eq!(compute_type_candidates(" float32 "), vec!["float32", "auto"]);
    }

    #[test]
    fn test_missing_model_classification() {
        assert!(is_missing_model_error(&LoadError::invalid("Model NOT FOUND")));
        assert!(is_missing_model_error(&LoadError::invalid("No such file or directory")));
        assert!(is_missing_model_error(&missing()));
        assert!(!is_missing_model_error(&unsupported()));
        assert!(!is_missing_model_error(&LoadError::invalid("invalid device 'tpu'")));
    }

    #[test]
    fn test_float16_falls_back_to_int8_float32() {
        let loader = FakeLoader::new().reject("float16", unsupported);
        let cache = ModelCache::new(loader, "auto", "float16");

        let model = cache.get_or_load("base").unwrap();

        assert_eq!(cache.loader().attempts(), vec!["float16", "int8_float32"]);
        assert_eq!(model.compute_type, "int8_float32");
        assert_eq!(model.name, "base");
        assert_eq!(model.device, "auto");
    }

    #[test]
    fn test_second_lookup_hits_cache() {
        let cache = ModelCache::new(FakeLoader::new(), "cpu", "auto");

        let first = cache.get_or_load("small").unwrap();
        let second = cache.get_or_load("small").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loader().attempts().len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_forces_a_reload() {
        let cache = ModelCache::new(FakeLoader::new(), "cpu", "auto");
        cache.get_or_load("tiny").unwrap();
        cache.clear();
        assert!(cache.is_empty());

        cache.get_or_load("tiny").unwrap();
        assert_eq!(cache.loader().attempts().len(), 2);
    }

    #[test]
    fn test_exhausted_candidates_with_missing_files_is_unavailable() {
        let loader = FakeLoader::new()
            .reject("float16", unsupported)
            .reject("int8_float32", missing)
            .reject("int8", missing)
            .reject("auto", missing);
        let cache = ModelCache::new(loader, "cpu", "float16");

        let err = cache.get_or_load("base").unwrap_err();

        match err {
            WhisperError::ModelUnavailable(message) => {
                assert!(message.contains("'base'"));
                assert!(message.contains("not available locally"));
            }
            other => panic!("expected ModelUnavailable, got {:?}", other),
        }
        assert_eq!(cache.loader().attempts(), vec!["float16", "int8_float32", "int8", "auto"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_exhausted_candidates_reraise_last_error() {
        let loader =
            FakeLoader::new().reject("auto", || LoadError::invalid("invalid device 'tpu'"));
        let cache = ModelCache::new(loader, "tpu", "auto");

        let err = cache.get_or_load("base").unwrap_err();

        assert!(matches!(err, WhisperError::Load(LoadError::InvalidArgument(_))));
        assert_eq!(err.to_string(), "invalid device 'tpu'");
    }

    #[test]
    fn test_fatal_error_stops_the_fallback_loop() {
        let loader = FakeLoader::new().reject("float16", || {
            LoadError::Fatal(anyhow::anyhow!("model.safetensors: no such file"))
        });
        let cache = ModelCache::new(loader, "cuda", "float16");

        let err = cache.get_or_load("base").unwrap_err();

        assert!(matches!(err, WhisperError::Load(LoadError::Fatal(_))));
        assert_eq!(cache.loader().attempts(), vec!["float16"]);
    }

    /// Counts loads per name and the peak number of loads in flight.
    #[derive(Default)]
    struct SlowLoader {
        loads: Mutex<HashMap<String, usize>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ModelLoader for SlowLoader {
        type Model = String;

        fn load(
            &self,
            name: &str,
            _device: &str,
            _compute_type: &str,
        ) -> Result<String, LoadError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            *self.loads.lock().unwrap().entry(name.to_string()).or_default() += 1;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(name.to_string())
        }
    }

    #[test]
    fn test_concurrent_requests_load_each_model_once_and_one_at_a_time() {
        let cache = Arc::new(ModelCache::new(SlowLoader::default(), "cpu", "auto"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let name = if i % 2 == 0 { "a" } else { "b" };
                thread::spawn(move || cache.get_or_load(name).unwrap())
            })
            .collect();
        for handle in handles {
            let model = handle.join().unwrap();
            assert!(model.as_str() == "a" || model.as_str() == "b");
        }

        let loads = cache.loader().loads.lock().unwrap().clone();
        assert_eq!(loads.get("a"), Some(&1));
        assert_eq!(loads.get("b"), Some(&1));
        assert_eq!(cache.loader().max_active.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);
    }
}
