use crate::domain::quality::QualityProfile;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

/// Per-quality playlist. ffmpeg writes these; we read them back to learn the
/// segment order and durations.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub version: u8,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<MediaSegment>,
    pub end_list: bool,
    pub playlist_type: Option<String>,
    pub independent_segments: bool,
}

impl MediaPlaylist {
    pub fn new(target_duration: u64) -> Self {
        Self {
            version: 3,
            target_duration,
            media_sequence: 0,
            segments: Vec::new(),
            end_list: true,
            playlist_type: None,
            independent_segments: false,
        }
    }

    pub fn add_segment(&mut self, duration: f64, uri: String) {
        self.segments.push(MediaSegment { duration, uri });
    }

    /// Parse the subset of tags ffmpeg's HLS muxer emits for VOD output.
    /// Unknown tags are ignored.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("#EXTM3U") {
            return Err("playlist does not start with #EXTM3U".to_string());
        }

        let mut playlist = MediaPlaylist::new(0);
        playlist.end_list = false;
        let mut pending_duration: Option<f64> = None;

        for line in lines {
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                playlist.version = value.parse().map_err(|_| format!("bad version: {value}"))?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = value
                    .parse()
                    .map_err(|_| format!("bad target duration: {value}"))?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                playlist.media_sequence = value
                    .parse()
                    .map_err(|_| format!("bad media sequence: {value}"))?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
                playlist.playlist_type = Some(value.to_string());
            } else if line == "#EXT-X-INDEPENDENT-SEGMENTS" {
                playlist.independent_segments = true;
            } else if line == "#EXT-X-ENDLIST" {
                playlist.end_list = true;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value.split(',').next().unwrap_or_default();
                pending_duration = Some(
                    duration
                        .parse()
                        .map_err(|_| format!("bad segment duration: {duration}"))?,
                );
            } else if line.starts_with('#') {
                continue;
            } else {
                let duration = pending_duration
                    .take()
                    .ok_or_else(|| format!("segment {line} has no #EXTINF"))?;
                playlist.add_segment(duration, line.to_string());
            }
        }

        Ok(playlist)
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        out.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));

        if let Some(pt) = &self.playlist_type {
            out.push_str(&format!("#EXT-X-PLAYLIST-TYPE:{}\n", pt));
        }

        if self.independent_segments {
            out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
        }

        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.6},\n", segment.duration));
            out.push_str(&segment.uri);
            out.push('\n');
        }

        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }

        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        write_file(path, &self.render()).await
    }
}

/// One `#EXT-X-STREAM-INF` entry of the master manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub resolution: String,
    pub uri: String,
}

impl VariantStream {
    /// Variant for a rendition whose playlist lives at `uri` relative to the
    /// master manifest.
    pub fn for_profile(profile: &QualityProfile, uri: String) -> Self {
        Self {
            bandwidth: profile.combined_bitrate_bps(),
            resolution: profile.resolution(),
            uri,
        }
    }
}

/// Top-level manifest listing every rendition of a video.
#[derive(Debug, Clone, Default)]
pub struct MasterPlaylist {
    pub variants: Vec<VariantStream>,
}

impl MasterPlaylist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variant(&mut self, variant: VariantStream) {
        self.variants.push(variant);
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for variant in &self.variants {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n",
                variant.bandwidth, variant.resolution
            ));
            out.push_str(&variant.uri);
            out.push('\n');
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        write_file(path, &self.render()).await
    }
}

async fn write_file(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let mut file = File::create(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
