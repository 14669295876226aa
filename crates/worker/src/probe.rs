//! Media inspector wrapper.
//!
//! Runs `ffprobe` against a local file and condenses its JSON into a
//! `SourceProfile`: codec, geometry, bit depth, bitrate, HDR signalling
//! (including the side data that distinguishes static HDR10 from the
//! dynamic flavors), and the ordered audio streams.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use av1_farm_protocol::{AudioTrack, SourceProfile};

/// How long the inspector may run before the probe counts as hung.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not read the file (missing, permissions, exit != 0).
    #[error("inspector could not read the file: {0}")]
    Unreadable(String),

    /// ffprobe did not finish within the timeout.
    #[error("inspector timed out after {PROBE_TIMEOUT:?}")]
    Timeout,

    /// ffprobe produced output we could not interpret.
    #[error("inspector output was malformed: {0}")]
    Malformed(String),

    /// The file is readable but carries no video stream.
    #[error("no video stream found")]
    NoVideoStream,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
        pub pix_fmt: Option<String>,
        pub bits_per_raw_sample: Option<String>,
        pub color_transfer: Option<String>,
        pub color_primaries: Option<String>,
        pub color_space: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub nb_frames: Option<String>,
        #[serde(default)]
        pub side_data_list: Vec<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probes a media file with ffprobe and returns its source profile.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format`
/// under a timeout and parses the JSON output.
pub async fn probe_file(path: &Path) -> Result<SourceProfile, ProbeError> {
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path)
    .kill_on_drop(true);

    let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Unreadable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Unreadable(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a `SourceProfile`.
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceProfile, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Malformed(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe
        .format
        .ok_or_else(|| ProbeError::Malformed("missing format section".to_string()))?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::Malformed(
            "video stream has no dimensions".to_string(),
        ));
    }

    // Stream bitrate when the container reports one, format bitrate as the
    // fallback (mkv rarely carries per-stream rates).
    let bitrate = parse_number(video.bit_rate.as_deref())
        .or_else(|| parse_number(format.bit_rate.as_deref()))
        .unwrap_or(0);

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let frame_rate = parse_frame_rate(video.avg_frame_rate.as_deref())
        .or_else(|| parse_frame_rate(video.r_frame_rate.as_deref()))
        .unwrap_or(0.0);

    let total_frames = parse_number(video.nb_frames.as_deref())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| (frame_rate * duration_secs).round() as u64);

    let side_data = SideData::collect(&video.side_data_list);

    let audio = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioTrack {
            codec: s.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
            channels: s.channels.unwrap_or(2),
            bitrate: parse_number(s.bit_rate.as_deref()).unwrap_or(0),
        })
        .collect();

    Ok(SourceProfile {
        container: format.format_name.unwrap_or_default(),
        video_codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        width,
        height,
        bit_depth: detect_bit_depth(video),
        frame_rate,
        bitrate,
        duration_secs,
        total_frames,
        color_transfer: video.color_transfer.clone(),
        color_primaries: video.color_primaries.clone(),
        color_space: video.color_space.clone(),
        mastering_display: side_data.mastering_display,
        content_light_level: side_data.content_light_level,
        dolby_vision_profile: side_data.dolby_vision_profile,
        hdr10plus_present: side_data.hdr10plus_present,
        audio,
    })
}

/// Bit depth from stream metadata, checked in reliability order:
/// `bits_per_raw_sample` first, then the pixel format name.
fn detect_bit_depth(stream: &ffprobe_json::Stream) -> u32 {
    if let Some(bits) = stream
        .bits_per_raw_sample
        .as_deref()
        .and_then(|b| b.parse::<u32>().ok())
    {
        if bits > 0 {
            return bits;
        }
    }
    if let Some(pix_fmt) = &stream.pix_fmt {
        let fmt = pix_fmt.to_lowercase();
        if fmt.contains("10") || fmt.contains("p010") {
            return 10;
        }
        if fmt.contains("12") {
            return 12;
        }
    }
    8
}

/// The HDR-relevant side data entries of a video stream.
#[derive(Debug, Default)]
struct SideData {
    mastering_display: Option<String>,
    content_light_level: Option<String>,
    dolby_vision_profile: Option<u8>,
    hdr10plus_present: bool,
}

impl SideData {
    fn collect(entries: &[serde_json::Value]) -> Self {
        let mut out = SideData::default();
        for entry in entries {
            let Some(kind) = entry.get("side_data_type").and_then(|v| v.as_str()) else {
                continue;
            };
            if kind.contains("Mastering display") {
                out.mastering_display = Some(compact_side_data(entry));
            } else if kind.contains("Content light level") {
                out.content_light_level = Some(compact_side_data(entry));
            } else if kind.contains("DOVI configuration") || kind.contains("Dolby Vision") {
                out.dolby_vision_profile = entry
                    .get("dv_profile")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u8)
                    .or(Some(0));
            } else if kind.contains("SMPTE2094-40") || kind.contains("HDR Dynamic Metadata") {
                out.hdr10plus_present = true;
            }
        }
        out
    }
}

/// Side data entries are forwarded as compact JSON, minus the type tag.
fn compact_side_data(entry: &serde_json::Value) -> String {
    let mut copy = entry.clone();
    if let Some(map) = copy.as_object_mut() {
        map.remove("side_data_type");
    }
    copy.to_string()
}

fn parse_number(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse::<u64>().ok())
}

/// Parse an ffprobe rational like "24000/1001" into frames per second.
fn parse_frame_rate(value: Option<&str>) -> Option<f64> {
    let value = value?;
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}
