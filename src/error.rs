//! Error taxonomy for the transcoding pipeline.

use crate::domain::quality::Quality;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The source file was missing when the encode was about to start.
    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// The external transcoder failed for one quality.
    #[error("encode failed for {quality}: {cause}")]
    EncodeFailed { quality: Quality, cause: String },

    /// The master manifest could not be written after all encodes succeeded.
    #[error("failed to write master manifest: {0}")]
    ManifestWriteFailed(String),

    #[error("unknown quality label: {0}")]
    UnknownQuality(String),

    #[error("segment {index} of {quality} not found for video {video_id}")]
    SegmentNotFound {
        video_id: String,
        quality: String,
        index: u32,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A newer transcode request took over the job slot.
    #[error("run {run_token} for video {video_id} was superseded by a newer request")]
    Superseded { video_id: String, run_token: i64 },

    #[error("invalid video id: {0:?}")]
    InvalidVideoId(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt job record: {0}")]
    CorruptRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn encode_failed(quality: Quality, cause: impl Into<String>) -> Self {
        Self::EncodeFailed {
            quality,
            cause: cause.into(),
        }
    }

    /// Absence on the delivery side, mapped to not-found responses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::SegmentNotFound { .. })
    }
}
