use crate::domain::jobs::{JobCompletion, JobEvent, SegmentRecord, TranscodeJob};
use crate::domain::quality::Quality;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Run inside the completion transaction once the job row is known to
/// belong to the committing run. An error aborts the commit.
pub type PublishFn<'a> = &'a (dyn Fn() -> Result<()> + Send + Sync);

/// Persistence of job slots and segment rows. Writes carrying a run token
/// fail with `Superseded` when the slot has been taken over by a newer run.
#[async_trait]
pub trait TranscodeRepository: Send + Sync {
    /// Insert or reset the job slot of a video to `pending`, dropping the
    /// previous run's segments. Returns the new run token.
    async fn upsert_job(&self, video_id: &str, source_path: &Path) -> Result<i64>;

    /// `NotFound` if no transcode was ever requested for the video.
    async fn get_job_status(&self, video_id: &str) -> Result<TranscodeJob>;

    async fn mark_processing(&self, video_id: &str, run_token: i64) -> Result<()>;

    async fn fail_job(&self, video_id: &str, run_token: i64, message: &str) -> Result<()>;

    async fn insert_segments(
        &self,
        video_id: &str,
        run_token: i64,
        quality: Quality,
        segments: &[SegmentRecord],
    ) -> Result<()>;

    /// Mark the job completed, store its segments and run `publish`, all or
    /// nothing.
    async fn complete_job(&self, completion: &JobCompletion, publish: PublishFn<'_>)
        -> Result<()>;

    /// Segments ordered by quality ladder then index.
    async fn list_segments(
        &self,
        video_id: &str,
        quality: Option<Quality>,
    ) -> Result<Vec<SegmentRecord>>;

    async fn list_job_events(&self, video_id: &str) -> Result<Vec<JobEvent>>;

    /// Remove the job slot, its segments and its history.
    async fn delete_all_for_video(&self, video_id: &str) -> Result<()>;
}
