//! Static quality ladder.
//!
//! Every job encodes the full ladder in [`Quality::ALL`] order. All qualities
//! share the same segmentation parameters so players can switch renditions at
//! segment boundaries.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A rung of the quality ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
}

impl Quality {
    /// Fan-out order used by the orchestrator and the master manifest.
    pub const ALL: [Quality; 3] = [Quality::P360, Quality::P480, Quality::P720];

    pub fn label(self) -> &'static str {
        match self {
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
        }
    }

    pub fn profile(self) -> &'static QualityProfile {
        match self {
            Quality::P360 => &PROFILE_360P,
            Quality::P480 => &PROFILE_480P,
            Quality::P720 => &PROFILE_720P,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Quality::ALL
            .into_iter()
            .find(|q| q.label() == s)
            .ok_or_else(|| Error::UnknownQuality(s.to_string()))
    }
}

/// Encoding parameters for one rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub quality: Quality,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub frame_rate: u32,
    pub encoder_preset: &'static str,
    pub encoder_profile: &'static str,
    pub encoder_level: &'static str,
    pub buffer_size_kbps: u32,
    pub max_rate_kbps: u32,
}

impl QualityProfile {
    /// `WIDTHxHEIGHT`, as advertised in the master manifest.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Video plus audio bitrate in bits per second.
    pub fn combined_bitrate_bps(&self) -> u64 {
        (self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }
}

pub const PROFILE_360P: QualityProfile = QualityProfile {
    quality: Quality::P360,
    width: 640,
    height: 360,
    video_bitrate_kbps: 800,
    audio_bitrate_kbps: 96,
    frame_rate: 30,
    encoder_preset: "veryfast",
    encoder_profile: "main",
    encoder_level: "3.0",
    buffer_size_kbps: 1200,
    max_rate_kbps: 856,
};

pub const PROFILE_480P: QualityProfile = QualityProfile {
    quality: Quality::P480,
    width: 842,
    height: 480,
    video_bitrate_kbps: 1400,
    audio_bitrate_kbps: 128,
    frame_rate: 30,
    encoder_preset: "veryfast",
    encoder_profile: "main",
    encoder_level: "3.1",
    buffer_size_kbps: 2100,
    max_rate_kbps: 1498,
};

pub const PROFILE_720P: QualityProfile = QualityProfile {
    quality: Quality::P720,
    width: 1280,
    height: 720,
    video_bitrate_kbps: 2800,
    audio_bitrate_kbps: 128,
    frame_rate: 30,
    encoder_preset: "veryfast",
    encoder_profile: "main",
    encoder_level: "3.1",
    buffer_size_kbps: 4200,
    max_rate_kbps: 2996,
};

/// Segmentation shared by every rendition.
#[derive(Debug, Clone, Copy)]
pub struct Segmentation {
    pub segment_duration_secs: u32,
    /// ffmpeg `-hls_segment_type` value.
    pub segment_type: &'static str,
    pub segment_extension: &'static str,
    pub manifest_extension: &'static str,
    pub playlist_type: &'static str,
    pub hls_flags: &'static str,
}

pub const SEGMENTATION: Segmentation = Segmentation {
    segment_duration_secs: 4,
    segment_type: "mpegts",
    segment_extension: "ts",
    manifest_extension: "m3u8",
    playlist_type: "vod",
    hls_flags: "independent_segments",
};

/// Resolve a label such as `"480p"` to its profile.
pub fn resolve_profile(label: &str) -> Result<&'static QualityProfile> {
    label.parse::<Quality>().map(Quality::profile)
}
