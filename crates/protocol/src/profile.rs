//! Probed source metadata and the bucketing helpers built on it.
//!
//! A `SourceProfile` is what the worker's inspector run produces and what the
//! quality policy consumes. The bucketing functions map raw bitrates and
//! dimensions onto the keys of the quality lookup tables.

use serde::{Deserialize, Serialize};

use crate::types::HdrKind;

/// One audio stream of the source, in container order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Codec name as reported by the inspector (e.g. "aac", "dts", "truehd").
    pub codec: String,
    /// Channel count.
    pub channels: u32,
    /// Bitrate in bits per second, 0 when the container does not report one.
    pub bitrate: u64,
}

/// Everything the inspector learned about a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    /// Container format name.
    pub container: String,
    /// Video codec name (e.g. "h264", "hevc", "av1").
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    /// Pixel bit depth (8 or 10).
    pub bit_depth: u32,
    /// Frames per second.
    pub frame_rate: f64,
    /// Overall video bitrate in bits per second.
    pub bitrate: u64,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Frame count; estimated from fps x duration when not reported.
    pub total_frames: u64,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    /// Raw mastering-display side data, forwarded verbatim to the encoder.
    pub mastering_display: Option<String>,
    /// Raw content-light-level side data.
    pub content_light_level: Option<String>,
    /// Dolby Vision profile number when a DOVI configuration record exists.
    pub dolby_vision_profile: Option<u8>,
    /// SMPTE ST 2094-40 dynamic metadata present.
    pub hdr10plus_present: bool,
    /// Audio streams in container order.
    pub audio: Vec<AudioTrack>,
}

impl SourceProfile {
    /// HDR classification, evaluated in precedence order: a Dolby Vision
    /// configuration record wins over HDR10+ signalling, which wins over
    /// static HDR10 transfer/mastering metadata.
    pub fn hdr_kind(&self) -> HdrKind {
        if self.dolby_vision_profile.is_some() {
            return HdrKind::DolbyVision;
        }
        if self.hdr10plus_present {
            return HdrKind::Hdr10Plus;
        }
        let hdr_transfer = self
            .color_transfer
            .as_deref()
            .map(|t| t == "smpte2084" || t == "arib-std-b67")
            .unwrap_or(false);
        if hdr_transfer || self.mastering_display.is_some() {
            return HdrKind::Hdr10;
        }
        HdrKind::None
    }
}

/// Resolution class of a source, bucketed by pixel count so ultra-wide
/// content (e.g. 1920x808) lands with its peers instead of a tier lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionBucket {
    Sd,
    P720,
    P1080,
    P1440,
    K4,
}

impl ResolutionBucket {
    /// Bucket by pixel count: below 720x720 is SD, below 1280x1280 is 720p,
    /// below 1920x1920 is 1080p, below 2560x2560 is 1440p, everything else 4K.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        let pixels = width as u64 * height as u64;
        if pixels < 720 * 720 {
            ResolutionBucket::Sd
        } else if pixels < 1280 * 1280 {
            ResolutionBucket::P720
        } else if pixels < 1920 * 1920 {
            ResolutionBucket::P1080
        } else if pixels < 2560 * 2560 {
            ResolutionBucket::P1440
        } else {
            ResolutionBucket::K4
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionBucket::Sd => "sd",
            ResolutionBucket::P720 => "720p",
            ResolutionBucket::P1080 => "1080p",
            ResolutionBucket::P1440 => "1440p",
            ResolutionBucket::K4 => "4k",
        }
    }
}

impl std::fmt::Display for ResolutionBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video bitrate bucket used as a quality-lookup key.
pub fn bitrate_bucket(bitrate_bps: u64) -> &'static str {
    let mbps = bitrate_bps as f64 / 1_000_000.0;
    if mbps < 1.5 {
        "1M"
    } else if mbps < 3.0 {
        "2M"
    } else if mbps < 5.0 {
        "4M"
    } else if mbps < 7.0 {
        "6M"
    } else if mbps < 9.0 {
        "8M"
    } else if mbps < 12.0 {
        "10M"
    } else if mbps < 17.0 {
        "15M"
    } else if mbps < 25.0 {
        "20M"
    } else if mbps < 35.0 {
        "30M"
    } else {
        "40M+"
    }
}

/// Audio bitrate bucket, with thresholds that differ per codec family:
/// lossy stereo-oriented codecs, Dolby multichannel, and lossless/PCM each
/// occupy very different bitrate ranges.
pub fn audio_bitrate_bucket(bitrate_bps: u64, codec: &str) -> &'static str {
    let kbps = bitrate_bps as f64 / 1000.0;

    match codec {
        "aac" | "mp3" => {
            if kbps < 48.0 {
                "32k"
            } else if kbps < 80.0 {
                "64k"
            } else if kbps < 112.0 {
                "96k"
            } else if kbps < 160.0 {
                "128k"
            } else if kbps < 224.0 {
                "192k"
            } else if kbps < 288.0 {
                "256k"
            } else {
                "320k"
            }
        }
        "ac3" | "eac3" => {
            if kbps < 80.0 {
                "64k"
            } else if kbps < 112.0 {
                "96k"
            } else if kbps < 160.0 {
                "128k"
            } else if kbps < 224.0 {
                "192k"
            } else if kbps < 320.0 {
                "256k"
            } else if kbps < 448.0 {
                "384k"
            } else if kbps < 576.0 {
                "512k"
            } else {
                "640k+"
            }
        }
        "dts" | "truehd" | "flac" | "pcm" => {
            if kbps < 384.0 {
                "256k"
            } else if kbps < 640.0 {
                "512k"
            } else if kbps < 896.0 {
                "768k"
            } else if kbps < 1280.0 {
                "1024k"
            } else if kbps < 2000.0 {
                "1536k+"
            } else if kbps < 3000.0 {
                "2000k"
            } else if kbps < 5000.0 {
                "4000k"
            } else {
                "6000k+"
            }
        }
        _ => {
            if kbps < 96.0 {
                "64k"
            } else if kbps < 160.0 {
                "128k"
            } else if kbps < 256.0 {
                "192k"
            } else {
                "384k"
            }
        }
    }
}

/// Channel-count bucket used as a quality-lookup key.
pub fn channel_bucket(channels: u32) -> &'static str {
    if channels <= 1 {
        "1ch"
    } else if channels <= 2 {
        "2ch"
    } else if channels <= 6 {
        "6ch"
    } else {
        "8ch"
    }
}
