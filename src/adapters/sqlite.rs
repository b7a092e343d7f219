//! SQLite `TranscodeRepository` implementation.

use crate::domain::jobs::{
    JobCompletion, JobEvent, JobStatus, SegmentRecord, TranscodeJob,
};
use crate::domain::quality::Quality;
use crate::error::{Error, Result};
use crate::ports::repository::{PublishFn, TranscodeRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, FromRow)]
struct JobRow {
    video_id: String,
    source_path: String,
    manifest_path: Option<String>,
    total_segment_count: i64,
    status: String,
    error_message: Option<String>,
    run_token: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for TranscodeJob {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(TranscodeJob {
            status: parse_status(&row.status)?,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
            video_id: row.video_id,
            source_path: PathBuf::from(row.source_path),
            manifest_path: row.manifest_path.map(PathBuf::from),
            total_segment_count: row.total_segment_count as u32,
            error_message: row.error_message,
            run_token: row.run_token,
        })
    }
}

#[derive(Debug, FromRow)]
struct SegmentRow {
    video_id: String,
    quality: String,
    segment_index: i64,
    path: String,
    duration_seconds: f64,
    file_size_bytes: i64,
}

impl TryFrom<SegmentRow> for SegmentRecord {
    type Error = Error;

    fn try_from(row: SegmentRow) -> Result<Self> {
        Ok(SegmentRecord {
            quality: row
                .quality
                .parse()
                .map_err(|_| Error::CorruptRecord(format!("quality {:?}", row.quality)))?,
            video_id: row.video_id,
            index: row.segment_index as u32,
            path: PathBuf::from(row.path),
            duration_seconds: row.duration_seconds,
            file_size_bytes: row.file_size_bytes as u64,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    video_id: String,
    run_token: i64,
    status: String,
    message: Option<String>,
    created_at: String,
}

impl TryFrom<EventRow> for JobEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(JobEvent {
            status: parse_status(&row.status)?,
            created_at: parse_time(&row.created_at)?,
            video_id: row.video_id,
            run_token: row.run_token,
            message: row.message,
        })
    }
}

fn parse_status(s: &str) -> Result<JobStatus> {
    JobStatus::parse(s).ok_or_else(|| Error::CorruptRecord(format!("status {s:?}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("timestamp {s:?}: {e}")))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` and apply
    /// migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        let repo = Self::new(pool);
        repo.migrate().await?;
        info!(database_url, max_connections, "transcode store ready");
        Ok(repo)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Take the write lock and verify the slot still belongs to `run_token`.
    async fn fence(
        tx: &mut Transaction<'_, Sqlite>,
        video_id: &str,
        run_token: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transcode_job SET updated_at = ? WHERE video_id = ? AND run_token = ?",
        )
        .bind(now())
        .bind(video_id)
        .bind(run_token)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Superseded {
                video_id: video_id.to_string(),
                run_token,
            });
        }
        Ok(())
    }

    async fn record_event(
        tx: &mut Transaction<'_, Sqlite>,
        video_id: &str,
        run_token: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcode_job_event (video_id, run_token, status, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(video_id)
        .bind(run_token)
        .bind(status.as_str())
        .bind(message)
        .bind(now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_segments(
        tx: &mut Transaction<'_, Sqlite>,
        segments: &[SegmentRecord],
    ) -> Result<()> {
        for segment in segments {
            sqlx::query(
                r#"
                INSERT INTO transcode_segment
                    (video_id, quality, segment_index, path, duration_seconds, file_size_bytes)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&segment.video_id)
            .bind(segment.quality.label())
            .bind(segment.index as i64)
            .bind(segment.path.to_string_lossy().into_owned())
            .bind(segment.duration_seconds)
            .bind(segment.file_size_bytes as i64)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn transition(
        &self,
        video_id: &str,
        run_token: i64,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::fence(&mut tx, video_id, run_token).await?;

        sqlx::query("UPDATE transcode_job SET status = ?, error_message = ? WHERE video_id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        Self::record_event(&mut tx, video_id, run_token, status, error_message).await?;

        tx.commit().await?;
        debug!(video_id, run_token, %status, "job transition");
        Ok(())
    }
}

#[async_trait]
impl TranscodeRepository for SqliteRepository {
    async fn upsert_job(&self, video_id: &str, source_path: &Path) -> Result<i64> {
        let now = now();
        let mut tx = self.pool.begin().await?;

        let run_token: i64 = sqlx::query_scalar(
            "INSERT INTO transcode_run (video_id, source_path, requested_at) VALUES (?, ?, ?) RETURNING run_token",
        )
        .bind(video_id)
        .bind(source_path.to_string_lossy().into_owned())
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO transcode_job
                (video_id, source_path, manifest_path, total_segment_count, status,
                 error_message, run_token, created_at, updated_at)
            VALUES (?, ?, NULL, 0, ?, NULL, ?, ?, ?)
            ON CONFLICT(video_id) DO UPDATE SET
                source_path = excluded.source_path,
                manifest_path = NULL,
                total_segment_count = 0,
                status = excluded.status,
                error_message = NULL,
                run_token = excluded.run_token,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(video_id)
        .bind(source_path.to_string_lossy().into_owned())
        .bind(JobStatus::Pending.as_str())
        .bind(run_token)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM transcode_segment WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        Self::record_event(&mut tx, video_id, run_token, JobStatus::Pending, None).await?;

        tx.commit().await?;
        Ok(run_token)
    }

    async fn get_job_status(&self, video_id: &str) -> Result<TranscodeJob> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM transcode_job WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("transcode job", video_id))?
            .try_into()
    }

    async fn mark_processing(&self, video_id: &str, run_token: i64) -> Result<()> {
        self.transition(video_id, run_token, JobStatus::Processing, None)
            .await
    }

    async fn fail_job(&self, video_id: &str, run_token: i64, message: &str) -> Result<()> {
        self.transition(video_id, run_token, JobStatus::Failed, Some(message))
            .await
    }

    async fn insert_segments(
        &self,
        video_id: &str,
        run_token: i64,
        quality: Quality,
        segments: &[SegmentRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::fence(&mut tx, video_id, run_token).await?;

        if let Some(stray) = segments
            .iter()
            .find(|s| s.video_id != video_id || s.quality != quality)
        {
            return Err(Error::CorruptRecord(format!(
                "segment {}/{}#{} inserted under {}/{}",
                stray.video_id, stray.quality, stray.index, video_id, quality
            )));
        }
        Self::write_segments(&mut tx, segments).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        completion: &JobCompletion,
        publish: PublishFn<'_>,
    ) -> Result<()> {
        let video_id = completion.video_id.as_str();
        let mut tx = self.pool.begin().await?;
        Self::fence(&mut tx, video_id, completion.run_token).await?;

        sqlx::query(
            r#"
            UPDATE transcode_job SET
                status = ?,
                manifest_path = ?,
                total_segment_count = ?,
                error_message = NULL
            WHERE video_id = ?
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(completion.manifest_path.to_string_lossy().into_owned())
        .bind(completion.segments.len() as i64)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM transcode_segment WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        Self::write_segments(&mut tx, &completion.segments).await?;
        Self::record_event(
            &mut tx,
            video_id,
            completion.run_token,
            JobStatus::Completed,
            None,
        )
        .await?;

        // The write lock is held until commit, so no newer request can take
        // the slot between publishing and committing.
        publish()?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_segments(
        &self,
        video_id: &str,
        quality: Option<Quality>,
    ) -> Result<Vec<SegmentRecord>> {
        let rows = match quality {
            Some(quality) => {
                sqlx::query_as::<_, SegmentRow>(
                    "SELECT * FROM transcode_segment WHERE video_id = ? AND quality = ? ORDER BY segment_index",
                )
                .bind(video_id)
                .bind(quality.label())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SegmentRow>(
                    "SELECT * FROM transcode_segment WHERE video_id = ? ORDER BY segment_index",
                )
                .bind(video_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut segments = rows
            .into_iter()
            .map(SegmentRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        segments.sort_by_key(|s| (s.quality, s.index));
        Ok(segments)
    }

    async fn list_job_events(&self, video_id: &str) -> Result<Vec<JobEvent>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT video_id, run_token, status, message, created_at FROM transcode_job_event WHERE video_id = ? ORDER BY id",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(JobEvent::try_from)
        .collect()
    }

    async fn delete_all_for_video(&self, video_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // transcode_run keeps its rows so tokens are never handed out twice.
        for table in ["transcode_segment", "transcode_job_event", "transcode_job"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE video_id = ?"))
                .bind(video_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
