//! ffmpeg-backed [`Encoder`].
//!
//! One ffmpeg process per rendition, muxing straight to HLS. Progress is read
//! from `-progress pipe:1` on stdout; stderr is kept as the failure cause.

use crate::domain::hls::MediaPlaylist;
use crate::domain::jobs::{EncodedRendition, EncodedSegment};
use crate::domain::layout::{playlist_file_name, segment_file_name, segment_file_pattern};
use crate::domain::quality::{Quality, QualityProfile, SEGMENTATION};
use crate::error::{Error, Result};
use crate::ports::encoder::Encoder;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Pixel format every rendition is encoded with.
pub const PIXEL_FORMAT: &str = "yuv420p";
/// GOP length in frames; keyframes are additionally forced on every
/// segment boundary.
pub const KEYFRAME_INTERVAL: u32 = 48;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Source duration in seconds, if ffprobe can tell.
    async fn probe_duration(&self, source: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(source)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| *d > 0.0)
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

/// ffmpeg arguments encoding `source` into an HLS rendition under `dest_dir`.
pub fn build_args(source: &Path, dest_dir: &Path, profile: &QualityProfile) -> Vec<OsString> {
    let seg = SEGMENTATION;
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |a: &str| args.push(a.into());

    push("-hide_banner");
    push("-nostdin");
    push("-y");
    push("-loglevel");
    push("error");
    push("-nostats");
    push("-progress");
    push("pipe:1");
    push("-i");
    args.push(source.as_os_str().to_owned());

    let mut push = |a: String| args.push(a.into());
    push("-map".into());
    push("0:v:0".into());
    push("-map".into());
    push("0:a:0?".into());
    push("-vf".into());
    push(format!("scale={}:{}", profile.width, profile.height));
    push("-c:v".into());
    push("libx264".into());
    push("-preset".into());
    push(profile.encoder_preset.into());
    push("-profile:v".into());
    push(profile.encoder_profile.into());
    push("-level".into());
    push(profile.encoder_level.into());
    push("-b:v".into());
    push(format!("{}k", profile.video_bitrate_kbps));
    push("-maxrate".into());
    push(format!("{}k", profile.max_rate_kbps));
    push("-bufsize".into());
    push(format!("{}k", profile.buffer_size_kbps));
    push("-r".into());
    push(profile.frame_rate.to_string());
    push("-pix_fmt".into());
    push(PIXEL_FORMAT.into());
    push("-g".into());
    push(KEYFRAME_INTERVAL.to_string());
    push("-keyint_min".into());
    push(KEYFRAME_INTERVAL.to_string());
    push("-sc_threshold".into());
    push("0".into());
    push("-force_key_frames".into());
    push(format!("expr:gte(t,n_forced*{})", seg.segment_duration_secs));
    push("-c:a".into());
    push("aac".into());
    push("-b:a".into());
    push(format!("{}k", profile.audio_bitrate_kbps));
    push("-ac".into());
    push("2".into());
    push("-f".into());
    push("hls".into());
    push("-hls_time".into());
    push(seg.segment_duration_secs.to_string());
    push("-hls_playlist_type".into());
    push(seg.playlist_type.into());
    push("-hls_segment_type".into());
    push(seg.segment_type.into());
    push("-hls_flags".into());
    push(seg.hls_flags.into());
    push("-hls_segment_filename".into());

    args.push(dest_dir.join(segment_file_pattern()).into_os_string());
    args.push(dest_dir.join(playlist_file_name()).into_os_string());
    args
}

/// Tracks `-progress` key/value output of one ffmpeg run.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    pub out_time_secs: f64,
    pub finished: bool,
}

impl ProgressTracker {
    /// Feed one line; returns true at the end of a progress block.
    pub fn feed(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.trim().split_once('=') else {
            return false;
        };
        match key {
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds.
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_secs = us.max(0) as f64 / 1_000_000.0;
                }
                false
            }
            "progress" => {
                self.finished = value == "end";
                true
            }
            _ => false,
        }
    }

    pub fn percent(&self, total_secs: Option<f64>) -> Option<f64> {
        total_secs.map(|total| (self.out_time_secs / total * 100.0).clamp(0.0, 100.0))
    }
}

/// Read the playlist ffmpeg left in `dest_dir` and describe the segments it
/// lists, in playlist order.
pub async fn collect_rendition(dest_dir: &Path, quality: Quality) -> Result<EncodedRendition> {
    let playlist_file = playlist_file_name();
    let content = tokio::fs::read_to_string(dest_dir.join(&playlist_file))
        .await
        .map_err(|e| Error::encode_failed(quality, format!("playlist not readable: {e}")))?;
    let playlist =
        MediaPlaylist::parse(&content).map_err(|e| Error::encode_failed(quality, e))?;

    if playlist.segments.is_empty() {
        return Err(Error::encode_failed(quality, "playlist lists no segments"));
    }

    let mut segments = Vec::with_capacity(playlist.segments.len());
    for (index, entry) in playlist.segments.iter().enumerate() {
        let index = index as u32;
        let expected = segment_file_name(index);
        if entry.uri != expected {
            return Err(Error::encode_failed(
                quality,
                format!("segment {index} is {:?}, expected {expected:?}", entry.uri),
            ));
        }
        let metadata = tokio::fs::metadata(dest_dir.join(&entry.uri))
            .await
            .map_err(|e| Error::encode_failed(quality, format!("{}: {e}", entry.uri)))?;

        segments.push(EncodedSegment {
            index,
            file_name: entry.uri.clone(),
            duration_seconds: entry.duration,
            file_size_bytes: metadata.len(),
        });
    }

    Ok(EncodedRendition {
        quality,
        playlist_file,
        segments,
    })
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        source: &Path,
        dest_dir: &Path,
        profile: &'static QualityProfile,
    ) -> Result<EncodedRendition> {
        let quality = profile.quality;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::SourceNotFound(source.to_path_buf()));
        }
        tokio::fs::create_dir_all(dest_dir).await?;

        let total_secs = self.probe_duration(source).await;
        let args = build_args(source, dest_dir, profile);
        debug!(%quality, ?args, "spawning ffmpeg");

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::encode_failed(quality, format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress = async {
            let Some(stdout) = stdout else { return };
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            let mut tracker = ProgressTracker::default();
            let mut last_logged = -1.0;
            while let Some(Ok(line)) = lines.next().await {
                if tracker.feed(&line) {
                    let percent = tracker.percent(total_secs);
                    if tracker.finished || percent.map_or(true, |p| p - last_logged >= 10.0) {
                        last_logged = percent.unwrap_or(0.0);
                        debug!(
                            %quality,
                            out_time_secs = tracker.out_time_secs,
                            percent = ?percent.map(|p| p.round()),
                            "encode progress"
                        );
                    }
                }
            }
        };

        let errors = async {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL_LINES).await,
                None => VecDeque::new(),
            }
        };

        let ((), tail) = tokio::join!(progress, errors);
        let status = child
            .wait()
            .await
            .map_err(|e| Error::encode_failed(quality, format!("ffmpeg wait failed: {e}")))?;

        if !status.success() {
            let stderr = Vec::from(tail).join("\n");
            warn!(%quality, %status, "ffmpeg failed");
            let cause = if stderr.is_empty() {
                format!("ffmpeg exited with {status}")
            } else {
                format!("ffmpeg exited with {status}: {stderr}")
            };
            return Err(Error::encode_failed(quality, cause));
        }

        let rendition = collect_rendition(dest_dir, quality).await?;
        info!(
            %quality,
            segments = rendition.segment_count(),
            "rendition encoded"
        );
        Ok(rendition)
    }
}

/// Drain `reader` to EOF, keeping its last `limit` lines. Invalid UTF-8 is
/// replaced; only EOF or an I/O error ends the read.
async fn read_tail<R: AsyncRead + Unpin>(reader: R, limit: usize) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(limit);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&buf).trim_end().to_string());
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quality::{PROFILE_360P, PROFILE_720P};

    fn arg_after<'a>(args: &'a [OsString], flag: &str) -> &'a str {
        let pos = args
            .iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("{flag} missing"));
        args[pos + 1].to_str().unwrap()
    }

    #[test]
    fn test_profile_values_pass_through() {
        let args = build_args(Path::new("/in/src.mp4"), Path::new("/out/720p"), &PROFILE_720P);
        assert_eq!(arg_after(&args, "-i"), "/in/src.mp4");
        assert_eq!(arg_after(&args, "-vf"), "scale=1280:720");
        assert_eq!(arg_after(&args, "-b:v"), "2800k");
        assert_eq!(arg_after(&args, "-maxrate"), "2996k");
        assert_eq!(arg_after(&args, "-bufsize"), "4200k");
        assert_eq!(arg_after(&args, "-b:a"), "128k");
        assert_eq!(arg_after(&args, "-r"), "30");
        assert_eq!(arg_after(&args, "-preset"), "veryfast");
        assert_eq!(arg_after(&args, "-profile:v"), "main");
        assert_eq!(arg_after(&args, "-level"), "3.1");
    }

    #[test]
    fn test_fixed_segmentation_and_compat_flags() {
        let args = build_args(Path::new("src.mp4"), Path::new("/out/360p"), &PROFILE_360P);
        assert_eq!(arg_after(&args, "-pix_fmt"), "yuv420p");
        assert_eq!(arg_after(&args, "-g"), "48");
        assert_eq!(arg_after(&args, "-hls_time"), "4");
        assert_eq!(arg_after(&args, "-hls_segment_type"), "mpegts");
        assert_eq!(arg_after(&args, "-hls_flags"), "independent_segments");
        assert_eq!(
            arg_after(&args, "-hls_segment_filename"),
            "/out/360p/segment_%03d.ts"
        );
        assert_eq!(args.last().unwrap(), "/out/360p/playlist.m3u8");
    }

    #[test]
    fn test_progress_tracker() {
        let mut tracker = ProgressTracker::default();
        assert!(!tracker.feed("frame=120"));
        assert!(!tracker.feed("out_time_us=5000000"));
        assert!(tracker.feed("progress=continue"));
        assert!(!tracker.finished);
        assert_eq!(tracker.percent(Some(10.0)), Some(50.0));
        assert_eq!(tracker.percent(None), None);

        tracker.feed("out_time_us=N/A");
        assert_eq!(tracker.out_time_secs, 5.0);
        assert!(tracker.feed("progress=end"));
        assert!(tracker.finished);
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("360p");
        // A bogus binary proves no process is spawned.
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");

        let err = encoder
            .encode(&dir.path().join("missing.mp4"), &dest, &PROFILE_360P)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_encode_failed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.mp4");
        tokio::fs::write(&source, b"not really a video").await.unwrap();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");

        let err = encoder
            .encode(&source, &dir.path().join("360p"), &PROFILE_360P)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::EncodeFailed {
                quality: Quality::P360,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_collect_rendition_reads_playlist_order_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut playlist = MediaPlaylist::new(4);
        for (i, len) in [3usize, 5, 2].into_iter().enumerate() {
            let name = segment_file_name(i as u32);
            tokio::fs::write(dir.path().join(&name), vec![0u8; len]).await.unwrap();
            playlist.add_segment(if i == 2 { 1.5 } else { 4.0 }, name);
        }
        playlist
            .write_to(&dir.path().join(playlist_file_name()))
            .await
            .unwrap();

        let rendition = collect_rendition(dir.path(), Quality::P480).await.unwrap();
        assert_eq!(rendition.quality, Quality::P480);
        assert_eq!(rendition.playlist_file, "playlist.m3u8");
        let sizes: Vec<_> = rendition.segments.iter().map(|s| s.file_size_bytes).collect();
        assert_eq!(sizes, [3, 5, 2]);
        assert_eq!(rendition.segments[2].index, 2);
        assert_eq!(rendition.segments[2].duration_seconds, 1.5);
    }

    #[tokio::test]
    async fn test_collect_rendition_rejects_missing_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut playlist = MediaPlaylist::new(4);
        playlist.add_segment(4.0, segment_file_name(0));
        playlist
            .write_to(&dir.path().join(playlist_file_name()))
            .await
            .unwrap();

        assert!(matches!(
            collect_rendition(dir.path(), Quality::P360).await,
            Err(Error::EncodeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stderr_tail_survives_invalid_utf8() {
        let stderr: &[u8] = b"first\n\xff\xfe broken\nsecond\nlast words";
        let tail = read_tail(stderr, 3).await;
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with(" broken"));
        assert_eq!(tail[1], "second");
        assert_eq!(tail[2], "last words");
    }
}
