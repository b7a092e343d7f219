use crate::domain::jobs::EncodedRendition;
use crate::domain::quality::QualityProfile;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Produces one segmented rendition of a source video.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode `source` with `profile` into `dest_dir`, writing the segments
    /// and a playlist enumerating them.
    ///
    /// Fails with `SourceNotFound` before doing any work if `source` is
    /// missing, and with `EncodeFailed` if the transcoder fails. Partially
    /// written files are left in place.
    async fn encode(
        &self,
        source: &Path,
        dest_dir: &Path,
        profile: &'static QualityProfile,
    ) -> Result<EncodedRendition>;
}
