use crate::domain::quality::Quality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of a transcode job: `pending -> processing -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single job slot of a video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub video_id: String,
    pub source_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub total_segment_count: u32,
    pub status: JobStatus,
    pub error_message: Option<String>,
    /// Bumped by every transcode request; only the run holding the current
    /// token may write to this slot.
    pub run_token: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted media segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub video_id: String,
    pub quality: Quality,
    pub index: u32,
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
}

/// A segment as reported by the encoder, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSegment {
    pub index: u32,
    pub file_name: String,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
}

/// Output of one finished quality-level encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRendition {
    pub quality: Quality,
    pub playlist_file: String,
    pub segments: Vec<EncodedSegment>,
}

impl EncodedRendition {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// Everything committed atomically when a run succeeds.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub video_id: String,
    pub run_token: i64,
    pub manifest_path: PathBuf,
    pub segments: Vec<SegmentRecord>,
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub video_id: String,
    pub run_token: i64,
    pub status: JobStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("PENDING"), None);
    }

    #[test]
    fn test_only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
