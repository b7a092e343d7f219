//! On-disk layout of published and in-progress output.
//!
//! ```text
//! <root>/<video_id>/master.m3u8
//! <root>/<video_id>/<quality>/playlist.m3u8
//! <root>/<video_id>/<quality>/segment_NNN.ts
//! <root>/.staging/<video_id>/<run_token>/...   (same shape, unpublished)
//! ```

use crate::domain::quality::{Quality, SEGMENTATION};
use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const STAGING_DIR: &str = ".staging";

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").unwrap())
}

/// Reject ids that could escape the chunks root or collide with the
/// staging area.
pub fn validate_video_id(video_id: &str) -> Result<()> {
    if video_id_pattern().is_match(video_id) {
        Ok(())
    } else {
        Err(Error::InvalidVideoId(video_id.to_string()))
    }
}

pub fn master_file_name() -> String {
    format!("master.{}", SEGMENTATION.manifest_extension)
}

pub fn playlist_file_name() -> String {
    format!("playlist.{}", SEGMENTATION.manifest_extension)
}

pub fn segment_file_name(index: u32) -> String {
    format!("segment_{:03}.{}", index, SEGMENTATION.segment_extension)
}

/// ffmpeg `-hls_segment_filename` pattern matching [`segment_file_name`].
pub fn segment_file_pattern() -> String {
    format!("segment_%03d.{}", SEGMENTATION.segment_extension)
}

/// Master-relative reference to a quality's playlist.
pub fn playlist_uri(quality: Quality) -> String {
    format!("{}/{}", quality, playlist_file_name())
}

#[derive(Debug, Clone)]
pub struct ChunkLayout {
    root: PathBuf,
}

impl ChunkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.root.join(video_id)
    }

    pub fn master_path(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join(master_file_name())
    }

    pub fn quality_dir(&self, video_id: &str, quality: Quality) -> PathBuf {
        self.video_dir(video_id).join(quality.label())
    }

    pub fn segment_path(&self, video_id: &str, quality: Quality, index: u32) -> PathBuf {
        self.quality_dir(video_id, quality)
            .join(segment_file_name(index))
    }

    /// Parent of every staging directory of a video.
    pub fn staging_root(&self, video_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(video_id)
    }

    /// Private working directory of one run.
    pub fn staging_dir(&self, video_id: &str, run_token: i64) -> PathBuf {
        self.staging_root(video_id).join(run_token.to_string())
    }

    /// Where a replaced publication is parked until it is removed.
    pub fn retired_dir(&self, video_id: &str, run_token: i64) -> PathBuf {
        self.staging_root(video_id)
            .join(format!("{}.retired", run_token))
    }
}
