//! # Upload Buffering
//!
//! The audio decoder reads from a path, so each upload is written to its
//! own temporary file. [`TempUpload`] owns that file and deletes it when
//! dropped, on success and error paths alike.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension used when the uploaded filename has none.
const DEFAULT_SUFFIX: &str = ".mp3";

/// A request-scoped temporary copy of an uploaded file.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    /// Write `contents` to a fresh, uniquely named file that keeps the
    /// extension of `original_filename` (container probing relies on it).
    pub fn create(original_filename: &str, contents: &[u8]) -> io::Result<Self> {
        let suffix = suffix_for(original_filename);
        let mut file = tempfile::Builder::new()
            .prefix("whisper-upload-")
            .suffix(&suffix)
            .tempfile()?;

        file.write_all(contents)?;
        file.flush()?;

        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

/// `.ext` of the uploaded filename, or `.mp3` when it has none.
fn suffix_for(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_follows_original_extension() {
        assert_eq!(suffix_for("meeting.wav"), ".wav");
        assert_eq!(suffix_for("voice.memo.m4a"), ".m4a");
        assert_eq!(suffix_for("recording"), ".mp3");
        assert_eq!(suffix_for("trailing."), ".mp3");
    }

    #[test]
    fn test_file_is_written_and_removed_on_drop() {
        let upload = TempUpload::create("clip.wav", b"RIFF....").unwrap();
        let path = upload.path().to_path_buf();

        assert!(path.is_file());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("wav"));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF....");

        drop(upload);
        assert!(!path.exists());
    }

    #[test]
    fn test_each_upload_gets_its_own_file() {
        let first = TempUpload::create("a.mp3", b"one").unwrap();
        let second = TempUpload::create("a.mp3", b"two").unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn test_drop_tolerates_an_already_removed_file() {
        let upload = TempUpload::create("gone.ogg", b"data").unwrap();
        std::fs::remove_file(upload.path()).unwrap();
        drop(upload);
    }
}
