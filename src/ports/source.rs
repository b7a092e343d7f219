use std::path::{Path, PathBuf};

/// Resolves where the untranscoded upload of a video lives.
pub trait SourceLocator: Send + Sync {
    /// Default source path for a video when the caller does not supply one.
    fn source_path(&self, video_id: &str) -> PathBuf;

    /// Direct playback URL of a source file, used as the delivery fallback.
    fn source_url(&self, video_id: &str, source_path: Option<&Path>) -> String;
}
