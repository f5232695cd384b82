//! # Transcription Errors
//!
//! Two layers of errors live here:
//! - [`LoadError`] is the contract between the model cache and whatever
//!   constructs a model. It separates "this parameter combination is not
//!   accepted" (the cache moves on to the next compute type) from fatal
//!   failures such as unreadable or corrupt weight files.
//! - [`WhisperError`] is what the runner hands back to the HTTP layer,
//!   which decides the status code.

use thiserror::Error;

/// Failure reported by a [`ModelLoader`](crate::transcription::cache::ModelLoader).
#[derive(Debug, Error)]
pub enum LoadError {
    /// The loader rejected one of its arguments (device, compute type,
    /// model name, or a model file it could not obtain).
    #[error("{0}")]
    InvalidArgument(String),

    /// Anything else: I/O failures, corrupt weights, backend crashes.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl LoadError {
    pub fn invalid(message: impl Into<String>) -> Self {
        LoadError::InvalidArgument(message.into())
    }
}

#[derive(Debug, Error)]
pub enum WhisperError {
    /// Model files are not present locally. The operator has to fetch them.
    #[error("{0}")]
    ModelUnavailable(String),

    /// Last loader failure, re-raised unchanged once every compute type
    /// has been tried.
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Unable to load Whisper model '{0}' with any compute type.")]
    NoCandidates(String),

    #[error("audio decoding failed: {0}")]
    Audio(String),

    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type WhisperResult<T> = Result<T, WhisperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display_is_the_bare_message() {
        let err = LoadError::invalid("float16 unsupported");
        assert_eq!(err.to_string(), "float16 unsupported");

        let wrapped: WhisperError = err.into();
        assert_eq!(wrapped.to_string(), "float16 unsupported");
    }

    #[test]
    fn test_fatal_error_keeps_anyhow_message() {
        let err = LoadError::Fatal(anyhow::anyhow!("corrupt safetensors header"));
        assert_eq!(err.to_string(), "corrupt safetensors header");
    }
}
