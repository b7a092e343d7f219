use crate::domain::hls::{MasterPlaylist, VariantStream};
use crate::domain::jobs::{EncodedRendition, JobCompletion, SegmentRecord};
use crate::domain::layout::{master_file_name, playlist_uri, validate_video_id, ChunkLayout};
use crate::domain::quality::Quality;
use crate::error::{Error, Result};
use crate::ports::encoder::Encoder;
use crate::ports::repository::TranscodeRepository;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How a run ended, from the point of view of the run itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { segment_count: usize },
    Failed { cause: String },
    /// A newer request owns the job slot; nothing was written.
    Superseded,
}

/// Drives a video through `pending -> processing -> completed | failed`,
/// encoding every quality of the ladder concurrently.
pub struct OrchestratorService<E, R> {
    encoder: Arc<E>,
    repo: Arc<R>,
    layout: ChunkLayout,
    permits: Arc<Semaphore>,
}

impl<E, R> Clone for OrchestratorService<E, R> {
    fn clone(&self) -> Self {
        Self {
            encoder: Arc::clone(&self.encoder),
            repo: Arc::clone(&self.repo),
            layout: self.layout.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<E, R> OrchestratorService<E, R>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
{
    /// `max_concurrent_encodes` bounds encoder processes across all runs.
    pub fn new(
        encoder: Arc<E>,
        repo: Arc<R>,
        layout: ChunkLayout,
        max_concurrent_encodes: usize,
    ) -> Self {
        Self {
            encoder,
            repo,
            layout,
            permits: Arc::new(Semaphore::new(max_concurrent_encodes.max(1))),
        }
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Reset the job to `pending` and start a run in the background.
    /// Returns the token of the new run.
    pub async fn request_transcode(&self, video_id: &str, source_path: &Path) -> Result<i64> {
        validate_video_id(video_id)?;
        let run_token = self.repo.upsert_job(video_id, source_path).await?;
        info!(video_id, run_token, source = %source_path.display(), "transcode requested");

        let this = self.clone();
        let video_id = video_id.to_string();
        let source = source_path.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = this.run(&video_id, &source, run_token).await {
                error!(video_id, run_token, error = %e, "transcode run aborted");
            }
        });

        Ok(run_token)
    }

    /// Execute run `run_token` to the end. Errors are only returned when the
    /// job row itself could not be updated.
    pub async fn run(&self, video_id: &str, source: &Path, run_token: i64) -> Result<RunOutcome> {
        match self.repo.mark_processing(video_id, run_token).await {
            Ok(()) => {}
            Err(Error::Superseded { .. }) => {
                info!(video_id, run_token, "run superseded before start");
                return Ok(RunOutcome::Superseded);
            }
            Err(e) => return Err(e),
        }
        info!(video_id, run_token, "transcode started");

        match self.transcode(video_id, source, run_token).await {
            Ok(segment_count) => {
                info!(video_id, run_token, segment_count, "transcode completed");
                Ok(RunOutcome::Completed { segment_count })
            }
            Err(Error::Superseded { .. }) => {
                info!(video_id, run_token, "run superseded, output discarded");
                self.discard_run_dirs(video_id, run_token).await;
                Ok(RunOutcome::Superseded)
            }
            Err(e) => {
                let cause = e.to_string();
                error!(video_id, run_token, error = %cause, "transcode failed");
                match self.repo.fail_job(video_id, run_token, &cause).await {
                    Ok(()) => Ok(RunOutcome::Failed { cause }),
                    Err(Error::Superseded { .. }) => {
                        self.discard_run_dirs(video_id, run_token).await;
                        Ok(RunOutcome::Superseded)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drop every row and every directory of a video.
    pub async fn purge(&self, video_id: &str) -> Result<()> {
        validate_video_id(video_id)?;
        self.repo.delete_all_for_video(video_id).await?;
        remove_dir_if_exists(&self.layout.video_dir(video_id)).await?;
        remove_dir_if_exists(&self.layout.staging_root(video_id)).await?;
        info!(video_id, "video purged");
        Ok(())
    }

    async fn transcode(&self, video_id: &str, source: &Path, run_token: i64) -> Result<usize> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::SourceNotFound(source.to_path_buf()));
        }

        // A recreated database may hand out a token whose staging dir exists.
        let staging = self.layout.staging_dir(video_id, run_token);
        remove_dir_if_exists(&staging).await?;
        tokio::fs::create_dir_all(&staging).await?;

        let renditions = self.encode_ladder(source, &staging).await?;

        let mut master = MasterPlaylist::new();
        for rendition in &renditions {
            master.add_variant(VariantStream::for_profile(
                rendition.quality.profile(),
                playlist_uri(rendition.quality),
            ));
        }
        master
            .write_to(&staging.join(master_file_name()))
            .await
            .map_err(|e| Error::ManifestWriteFailed(e.to_string()))?;

        let segments = self.segment_records(video_id, &renditions);
        let segment_count = segments.len();
        let completion = JobCompletion {
            video_id: video_id.to_string(),
            run_token,
            manifest_path: self.layout.master_path(video_id),
            segments,
        };

        let published = self.layout.video_dir(video_id);
        let retired = self.layout.retired_dir(video_id, run_token);
        remove_dir_if_exists(&retired).await?;

        let publish = || publish_dir(&staging, &published, &retired);
        let committed = self.repo.complete_job(&completion, &publish).await;

        // Also reached when the commit failed after the swap.
        if let Err(e) = remove_dir_if_exists(&retired).await {
            warn!(video_id, error = %e, "failed to remove replaced output");
        }
        committed?;
        Ok(segment_count)
    }

    /// Remove the staging and retired dirs of a run that lost its slot.
    async fn discard_run_dirs(&self, video_id: &str, run_token: i64) {
        for dir in [
            self.layout.staging_dir(video_id, run_token),
            self.layout.retired_dir(video_id, run_token),
        ] {
            if let Err(e) = remove_dir_if_exists(&dir).await {
                warn!(video_id, run_token, error = %e, "failed to discard run output");
            }
        }
    }

    /// Encode every quality concurrently and wait for all of them. The first
    /// failure in ladder order wins.
    async fn encode_ladder(&self, source: &Path, staging: &Path) -> Result<Vec<EncodedRendition>> {
        let tasks = Quality::ALL.into_iter().map(|quality| {
            let encoder = Arc::clone(&self.encoder);
            let permits = Arc::clone(&self.permits);
            let source = source.to_path_buf();
            let dest = staging.join(quality.label());

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::encode_failed(quality, "encoder pool closed"))?;
                debug!(%quality, "encode started");
                encoder.encode(&source, &dest, quality.profile()).await
            });

            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::encode_failed(quality, format!("encode task died: {e}"))),
                }
            }
        });

        futures::future::join_all(tasks).await.into_iter().collect()
    }

    /// Rows for every encoded segment, pointing at the published location.
    fn segment_records(&self, video_id: &str, renditions: &[EncodedRendition]) -> Vec<SegmentRecord> {
        renditions
            .iter()
            .flat_map(|rendition| {
                let dir = self.layout.quality_dir(video_id, rendition.quality);
                rendition.segments.iter().map(move |segment| SegmentRecord {
                    video_id: video_id.to_string(),
                    quality: rendition.quality,
                    index: segment.index,
                    path: dir.join(&segment.file_name),
                    duration_seconds: segment.duration_seconds,
                    file_size_bytes: segment.file_size_bytes,
                })
            })
            .collect()
    }
}

/// Swap `staging` in as the published directory, parking the previous
/// publication at `retired`, which must not exist. Runs inside the
/// completion transaction, so it only renames.
fn publish_dir(staging: &Path, published: &Path, retired: &Path) -> Result<()> {
    let had_previous = match std::fs::rename(published, retired) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = std::fs::rename(staging, published) {
        if had_previous {
            let _ = std::fs::rename(retired, published);
        }
        return Err(e.into());
    }
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteRepository;
    use crate::domain::hls::MediaPlaylist;
    use crate::domain::jobs::{EncodedSegment, JobStatus};
    use crate::domain::layout::{playlist_file_name, segment_file_name};
    use crate::domain::quality::QualityProfile;
    use crate::ports::encoder::MockEncoder;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::PathBuf;

    async fn memory_repo() -> Arc<SqliteRepository> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteRepository::new(pool);
        repo.migrate().await.unwrap();
        Arc::new(repo)
    }

    /// Writes what ffmpeg would: `count` segments and a playlist.
    fn fake_encode(dest: &Path, profile: &QualityProfile, count: u32) -> Result<EncodedRendition> {
        std::fs::create_dir_all(dest)?;
        let mut playlist = MediaPlaylist::new(4);
        let mut segments = Vec::new();
        for index in 0..count {
            let file_name = segment_file_name(index);
            std::fs::write(dest.join(&file_name), vec![1u8; 100 + index as usize])?;
            playlist.add_segment(4.0, file_name.clone());
            segments.push(EncodedSegment {
                index,
                file_name,
                duration_seconds: 4.0,
                file_size_bytes: 100 + index as u64,
            });
        }
        std::fs::write(dest.join(playlist_file_name()), playlist.render())?;
        Ok(EncodedRendition {
            quality: profile.quality,
            playlist_file: playlist_file_name(),
            segments,
        })
    }

    fn source_file(dir: &Path) -> PathBuf {
        let source = dir.join("source.mp4");
        std::fs::write(&source, b"source").unwrap();
        source
    }

    #[tokio::test]
    async fn test_run_publishes_full_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder
            .expect_encode()
            .times(3)
            .returning(|_, dest, profile| fake_encode(dest, profile, 3));

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 2);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        let outcome = service.run("v1", &source, token).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { segment_count: 9 });

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_segment_count, 9);
        assert_eq!(job.manifest_path.as_deref(), Some(layout.master_path("v1").as_path()));

        let master = std::fs::read_to_string(layout.master_path("v1")).unwrap();
        assert!(master.contains("480p/playlist.m3u8"));
        for segment in repo.list_segments("v1", None).await.unwrap() {
            assert!(segment.path.is_file(), "{}", segment.path.display());
        }
        assert!(!layout.staging_dir("v1", token).exists());
    }

    #[tokio::test]
    async fn test_single_quality_failure_fails_whole_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().returning(|_, dest, profile| {
            if profile.quality == Quality::P480 {
                Err(Error::encode_failed(Quality::P480, "exit status: 1"))
            } else {
                fake_encode(dest, profile, 2)
            }
        });

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 4);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        let outcome = service.run("v1", &source, token).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { ref cause } if cause.contains("480p")));

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("encode failed for 480p: exit status: 1")
        );
        assert!(repo.list_segments("v1", None).await.unwrap().is_empty());
        assert!(!layout.master_path("v1").exists());
    }

    #[tokio::test]
    async fn test_missing_source_never_reaches_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().never();

        let repo = memory_repo().await;
        let service = OrchestratorService::new(
            Arc::new(encoder),
            repo.clone(),
            ChunkLayout::new(dir.path()),
            1,
        );
        let source = dir.path().join("absent.mp4");
        let token = repo.upsert_job("v1", &source).await.unwrap();
        service.run("v1", &source, token).await.unwrap();

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("source"));
    }

    #[tokio::test]
    async fn test_stale_run_is_superseded() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().never();

        let repo = memory_repo().await;
        let service = OrchestratorService::new(
            Arc::new(encoder),
            repo.clone(),
            ChunkLayout::new(dir.path()),
            1,
        );
        let stale = repo.upsert_job("v1", &source).await.unwrap();
        let fresh = repo.upsert_job("v1", &source).await.unwrap();

        let outcome = service.run("v1", &source, stale).await.unwrap();
        assert_eq!(outcome, RunOutcome::Superseded);

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.run_token, fresh);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_rerun_replaces_published_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        let mut seq = mockall::Sequence::new();
        encoder
            .expect_encode()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, dest, profile| fake_encode(dest, profile, 3));
        encoder
            .expect_encode()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_, dest, profile| fake_encode(dest, profile, 1));

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 1);

        let first = repo.upsert_job("v1", &source).await.unwrap();
        service.run("v1", &source, first).await.unwrap();
        let second = repo.upsert_job("v1", &source).await.unwrap();
        service.run("v1", &source, second).await.unwrap();

        assert_eq!(repo.list_segments("v1", None).await.unwrap().len(), 3);
        assert!(!layout.segment_path("v1", Quality::P720, 1).exists());
        assert!(!layout.retired_dir("v1", second).exists());
    }

    #[tokio::test]
    async fn test_purge_removes_rows_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder
            .expect_encode()
            .returning(|_, dest, profile| fake_encode(dest, profile, 1));

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 3);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        service.run("v1", &source, token).await.unwrap();
        service.purge("v1").await.unwrap();

        assert!(repo.get_job_status("v1").await.unwrap_err().is_not_found());
        assert!(!layout.video_dir("v1").exists());
        assert!(!layout.staging_root("v1").exists());
    }

    #[tokio::test]
    async fn test_invalid_video_id_is_rejected() {
        let repo = memory_repo().await;
        let service = OrchestratorService::new(
            Arc::new(MockEncoder::new()),
            repo,
            ChunkLayout::new("/tmp/unused"),
            1,
        );
        let err = service
            .request_transcode("../escape", Path::new("/in/a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVideoId(_)));
    }

    #[tokio::test]
    async fn test_unwritable_master_fails_job_without_segments() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder.expect_encode().returning(|_, dest, profile| {
            // A directory where the master manifest should go.
            std::fs::create_dir_all(dest.parent().unwrap().join(master_file_name()))?;
            fake_encode(dest, profile, 2)
        });

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 3);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        let outcome = service.run("v1", &source, token).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }), "{outcome:?}");

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.starts_with("failed to write master manifest"), "{message}");
        assert!(repo.list_segments("v1", None).await.unwrap().is_empty());
        assert!(!layout.video_dir("v1").exists());
    }

    /// Panics while encoding 720p.
    struct PanickingEncoder;

    #[async_trait::async_trait]
    impl Encoder for PanickingEncoder {
        async fn encode(
            &self,
            _source: &Path,
            dest_dir: &Path,
            profile: &'static QualityProfile,
        ) -> Result<EncodedRendition> {
            if profile.quality == Quality::P720 {
                panic!("encoder crashed");
            }
            fake_encode(dest_dir, profile, 2)
        }
    }

    #[tokio::test]
    async fn test_panicking_encode_task_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service =
            OrchestratorService::new(Arc::new(PanickingEncoder), repo.clone(), layout.clone(), 3);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        let outcome = service.run("v1", &source, token).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }), "{outcome:?}");

        let job = repo.get_job_status("v1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.contains("encode task died"), "{message}");
        assert!(message.contains("720p"), "{message}");
        assert!(repo.list_segments("v1", None).await.unwrap().is_empty());
    }

    /// Issues a newer request for the same video while encoding 360p.
    struct SupersedingEncoder {
        repo: Arc<SqliteRepository>,
        source: PathBuf,
    }

    #[async_trait::async_trait]
    impl Encoder for SupersedingEncoder {
        async fn encode(
            &self,
            _source: &Path,
            dest_dir: &Path,
            profile: &'static QualityProfile,
        ) -> Result<EncodedRendition> {
            if profile.quality == Quality::P360 {
                self.repo.upsert_job("v1", &self.source).await?;
            }
            fake_encode(dest_dir, profile, 2)
        }
    }

    #[tokio::test]
    async fn test_superseded_run_discards_its_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let encoder = SupersedingEncoder {
            repo: repo.clone(),
            source: source.clone(),
        };
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 1);

        let stale = repo.upsert_job("v1", &source).await.unwrap();
        let outcome = service.run("v1", &source, stale).await.unwrap();
        assert_eq!(outcome, RunOutcome::Superseded);

        assert!(!layout.staging_dir("v1", stale).exists());
        assert!(!layout.video_dir("v1").exists());
        assert!(repo.list_segments("v1", None).await.unwrap().is_empty());

        let job = repo.get_job_status("v1").await.unwrap();
        assert!(job.run_token > stale);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_leftover_retired_dir_does_not_block_publish() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path());
        let mut encoder = MockEncoder::new();
        encoder
            .expect_encode()
            .times(3)
            .returning(|_, dest, profile| fake_encode(dest, profile, 2));

        let repo = memory_repo().await;
        let layout = ChunkLayout::new(dir.path().join("chunks"));
        let service = OrchestratorService::new(Arc::new(encoder), repo.clone(), layout.clone(), 3);

        let token = repo.upsert_job("v1", &source).await.unwrap();
        let retired = layout.retired_dir("v1", token);
        std::fs::create_dir_all(&retired).unwrap();
        std::fs::write(retired.join("stale.ts"), b"old").unwrap();
        std::fs::create_dir_all(layout.video_dir("v1")).unwrap();
        std::fs::write(layout.video_dir("v1").join("old.ts"), b"old").unwrap();

        let outcome = service.run("v1", &source, token).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { segment_count: 6 });
        assert!(!retired.exists());
        assert!(layout.master_path("v1").is_file());
        assert!(!layout.video_dir("v1").join("old.ts").exists());
    }
}
