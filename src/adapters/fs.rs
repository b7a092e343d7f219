use crate::ports::source::SourceLocator;
use std::path::{Component, Path, PathBuf};

/// Default source extension of uploads.
pub const SOURCE_EXTENSION: &str = "mp4";

/// Sources live flat in an upload directory that the HTTP layer serves under
/// `base_url`.
#[derive(Debug, Clone)]
pub struct UploadDirLocator {
    upload_dir: PathBuf,
    base_url: String,
}

impl UploadDirLocator {
    pub fn new(upload_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Path of `path` relative to the upload dir, if it lies inside it.
    fn served_relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        let relative = if path.is_absolute() || path.starts_with(&self.upload_dir) {
            path.strip_prefix(&self.upload_dir).ok()?
        } else {
            path
        };
        relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then_some(relative)
    }
}

impl SourceLocator for UploadDirLocator {
    fn source_path(&self, video_id: &str) -> PathBuf {
        self.upload_dir
            .join(format!("{}.{}", video_id, SOURCE_EXTENSION))
    }

    fn source_url(&self, video_id: &str, source_path: Option<&Path>) -> String {
        let default_path = self.source_path(video_id);
        let path = source_path.unwrap_or(&default_path);

        match self.served_relative(path) {
            Some(relative) => {
                let segments: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                format!("{}/{}", self.base_url, segments.join("/"))
            }
            // Not under the served directory; hand out the raw location.
            None => format!("file://{}", path.display()),
        }
    }
}
