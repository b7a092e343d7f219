use crate::domain::jobs::{JobEvent, JobStatus, TranscodeJob};
use crate::domain::layout::{master_file_name, validate_video_id, ChunkLayout};
use crate::domain::quality::Quality;
use crate::error::{Error, Result};
use crate::ports::repository::TranscodeRepository;
use crate::ports::source::SourceLocator;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Completed,
    NotAvailable,
}

/// Where a player should go for a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    pub status: ManifestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
}

/// Read side of the pipeline. Never starts an encode.
pub struct DeliveryService<R, L> {
    repo: Arc<R>,
    locator: Arc<L>,
    layout: ChunkLayout,
    chunks_base_url: String,
}

impl<R, L> DeliveryService<R, L>
where
    R: TranscodeRepository,
    L: SourceLocator,
{
    /// `chunks_base_url` is the URL prefix the chunks root is served under.
    pub fn new(
        repo: Arc<R>,
        locator: Arc<L>,
        layout: ChunkLayout,
        chunks_base_url: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            locator,
            layout,
            chunks_base_url: chunks_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    /// Manifest URL of a completed video, or a fallback to its source.
    pub async fn get_manifest(&self, video_id: &str) -> Result<ManifestInfo> {
        validate_video_id(video_id)?;
        let job = match self.repo.get_job_status(video_id).await {
            Ok(job) => Some(job),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if let Some(job) = &job {
            if job.status == JobStatus::Completed
                && tokio::fs::try_exists(self.layout.master_path(video_id))
                    .await
                    .unwrap_or(false)
            {
                return Ok(ManifestInfo {
                    manifest_url: Some(format!(
                        "{}/{}/{}",
                        self.chunks_base_url,
                        video_id,
                        master_file_name()
                    )),
                    status: ManifestStatus::Completed,
                    fallback_url: None,
                });
            }
        }

        let recorded = job.as_ref().map(|j| j.source_path.as_path());
        debug!(video_id, has_job = job.is_some(), "manifest not available");
        Ok(ManifestInfo {
            manifest_url: None,
            status: ManifestStatus::NotAvailable,
            fallback_url: Some(self.locator.source_url(video_id, recorded)),
        })
    }

    /// Raw bytes of one published segment.
    pub async fn get_segment(&self, video_id: &str, quality: &str, index: u32) -> Result<Bytes> {
        let not_found = || Error::SegmentNotFound {
            video_id: video_id.to_string(),
            quality: quality.to_string(),
            index,
        };
        validate_video_id(video_id).map_err(|_| not_found())?;
        let quality: Quality = quality.parse().map_err(|_| not_found())?;

        match tokio::fs::read(self.layout.segment_path(video_id, quality, index)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_processing_status(&self, video_id: &str) -> Result<TranscodeJob> {
        validate_video_id(video_id)?;
        self.repo.get_job_status(video_id).await
    }

    pub async fn list_job_events(&self, video_id: &str) -> Result<Vec<JobEvent>> {
        validate_video_id(video_id)?;
        self.repo.list_job_events(video_id).await
    }
}
