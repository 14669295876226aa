//! Quality policy: source profile in, encode parameters (or a skip) out.
//!
//! Pure functions, no IO. CRF comes from a layered lookup keyed by
//! resolution bucket, source codec and source bitrate bucket, with
//! per-resolution defaults when no entry matches. Per-stream Opus bitrates
//! come from a codec/channel/bitrate table with channel-count fallbacks.

use av1_farm_protocol::{
    audio_bitrate_bucket, channel_bucket, ColorParams, EncodeParams, HdrKind, ResolutionBucket,
    SkipReason, SourceProfile,
};

/// Knobs the cluster config contributes to a policy decision.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs {
    pub encoder_preset: u8,
    pub skip_audio_transcode: bool,
}

/// Outcome of the policy: encode with these parameters, or do not touch the
/// file at all.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Encode(EncodeParams),
    Skip(SkipReason),
}

/// Per-resolution default CRF, used when no table entry matches. One step
/// per tier around a CRF 25 midpoint.
fn default_crf(bucket: ResolutionBucket) -> u8 {
    match bucket {
        ResolutionBucket::Sd => 28,
        ResolutionBucket::P720 => 27,
        ResolutionBucket::P1080 => 26,
        ResolutionBucket::P1440 => 25,
        ResolutionBucket::K4 => 24,
    }
}

/// Explicit CRF entries: (resolution, codec, bitrate bucket) -> CRF.
///
/// Starved sources get a higher CRF (there is no detail worth spending bits
/// on); generous sources get a lower one. Unlisted combinations fall back to
/// the resolution default.
const CRF_TABLE: &[(ResolutionBucket, &str, &str, u8)] = &[
    (ResolutionBucket::P1080, "h264", "1M", 30),
    (ResolutionBucket::P1080, "h264", "2M", 29),
    (ResolutionBucket::P1080, "h264", "4M", 27),
    (ResolutionBucket::P1080, "h264", "6M", 26),
    (ResolutionBucket::P1080, "h264", "8M", 26),
    (ResolutionBucket::P1080, "h264", "10M", 25),
    (ResolutionBucket::P1080, "h264", "15M", 24),
    (ResolutionBucket::P1080, "h264", "20M", 24),
    (ResolutionBucket::P1080, "h264", "30M", 23),
    (ResolutionBucket::P1080, "h264", "40M+", 22),
    (ResolutionBucket::P1080, "hevc", "4M", 28),
    (ResolutionBucket::P1080, "hevc", "8M", 26),
    (ResolutionBucket::P1080, "hevc", "10M", 25),
    (ResolutionBucket::P720, "h264", "1M", 30),
    (ResolutionBucket::P720, "h264", "2M", 28),
    (ResolutionBucket::P720, "h264", "4M", 27),
    (ResolutionBucket::P720, "h264", "6M", 26),
    (ResolutionBucket::K4, "hevc", "10M", 26),
    (ResolutionBucket::K4, "hevc", "15M", 25),
    (ResolutionBucket::K4, "hevc", "20M", 24),
    (ResolutionBucket::K4, "hevc", "30M", 23),
    (ResolutionBucket::K4, "hevc", "40M+", 22),
    (ResolutionBucket::K4, "h264", "20M", 24),
    (ResolutionBucket::K4, "h264", "30M", 23),
    (ResolutionBucket::P1440, "hevc", "10M", 25),
    (ResolutionBucket::P1440, "h264", "10M", 25),
    (ResolutionBucket::Sd, "h264", "1M", 30),
    (ResolutionBucket::Sd, "mpeg2video", "4M", 27),
];

/// CRF lookup with fall-through to the resolution default.
pub fn crf_for(bucket: ResolutionBucket, codec: &str, bitrate_bucket: &str) -> u8 {
    CRF_TABLE
        .iter()
        .find(|(b, c, br, _)| *b == bucket && *c == codec && *br == bitrate_bucket)
        .map(|(_, _, _, crf)| *crf)
        .unwrap_or_else(|| default_crf(bucket))
}

/// Channel-count fallback for the Opus bitrate, in kbps.
fn default_opus_bitrate(channels: u32) -> u32 {
    if channels <= 1 {
        48
    } else if channels <= 2 {
        96
    } else if channels <= 6 {
        160
    } else {
        192
    }
}

/// Explicit Opus entries: (codec, channel bucket, bitrate bucket) -> kbps.
const OPUS_TABLE: &[(&str, &str, &str, u32)] = &[
    ("aac", "2ch", "96k", 80),
    ("aac", "2ch", "128k", 96),
    ("aac", "2ch", "192k", 128),
    ("aac", "2ch", "256k", 160),
    ("aac", "6ch", "192k", 160),
    ("aac", "6ch", "256k", 192),
    ("aac", "6ch", "320k", 224),
    ("ac3", "2ch", "192k", 96),
    ("ac3", "6ch", "384k", 192),
    ("ac3", "6ch", "448k", 192),
    ("ac3", "6ch", "640k+", 224),
    ("eac3", "6ch", "256k", 160),
    ("eac3", "6ch", "384k", 192),
    ("eac3", "8ch", "640k+", 256),
    ("dts", "6ch", "768k", 224),
    ("dts", "6ch", "1024k", 256),
    ("dts", "6ch", "1536k+", 256),
    ("truehd", "6ch", "2000k", 256),
    ("truehd", "8ch", "4000k", 320),
    ("flac", "2ch", "768k", 160),
    ("flac", "2ch", "1024k", 160),
];

/// Opus bitrate for one audio stream, in kbps.
pub fn opus_bitrate_for(codec: &str, channels: u32, bitrate_bps: u64) -> u32 {
    let codec = normalize_audio_codec(codec);
    let channel_key = channel_bucket(channels);
    let bitrate_key = audio_bitrate_bucket(bitrate_bps, codec);
    OPUS_TABLE
        .iter()
        .find(|(c, ch, br, _)| *c == codec && *ch == channel_key && *br == bitrate_key)
        .map(|(_, _, _, kbps)| *kbps)
        .unwrap_or_else(|| default_opus_bitrate(channels))
}

fn normalize_audio_codec(codec: &str) -> &str {
    match codec {
        "e-ac3" | "eac-3" => "eac3",
        other => other,
    }
}

/// Bitrate an AV1 encode at the given CRF would land near, per resolution.
/// Used only for the already-efficient check on AV1 sources.
fn predicted_av1_bitrate(bucket: ResolutionBucket, crf: u8) -> f64 {
    let base = match bucket {
        ResolutionBucket::Sd => 1_000_000.0,
        ResolutionBucket::P720 => 2_000_000.0,
        ResolutionBucket::P1080 => 3_500_000.0,
        ResolutionBucket::P1440 => 6_000_000.0,
        ResolutionBucket::K4 => 10_000_000.0,
    };
    // Each CRF step below the default buys roughly 8% more bits.
    let steps = default_crf(bucket) as f64 - crf as f64;
    base * (1.0 + steps * 0.08)
}

/// Decide what to do with a probed source.
pub fn decide(profile: &SourceProfile, inputs: &PolicyInputs) -> PolicyDecision {
    let hdr = profile.hdr_kind();
    if hdr.is_dynamic() {
        return PolicyDecision::Skip(SkipReason::DynamicHdrUnpreservable);
    }

    let bucket = ResolutionBucket::from_dimensions(profile.width, profile.height);
    let bitrate_key = av1_farm_protocol::bitrate_bucket(profile.bitrate);
    let crf = crf_for(bucket, &profile.video_codec, bitrate_key);

    // An AV1 source already at (or under) the bitrate we would encode to is
    // not worth a generational re-encode.
    if profile.video_codec == "av1" && profile.bitrate > 0 {
        let predicted = predicted_av1_bitrate(bucket, crf);
        if (profile.bitrate as f64) <= predicted * 1.1 {
            return PolicyDecision::Skip(SkipReason::AlreadyEfficient);
        }
    }

    let color = match hdr {
        HdrKind::Hdr10 => Some(ColorParams::hdr10(
            profile.mastering_display.clone(),
            profile.content_light_level.clone(),
        )),
        _ => None,
    };

    // HDR10 requires a 10-bit pipeline even off an 8-bit-reported source.
    let pixel_format = if profile.bit_depth >= 10 || color.is_some() {
        "yuv420p10le".to_string()
    } else {
        "yuv420p".to_string()
    };

    let audio_bitrates_kbps = profile
        .audio
        .iter()
        .map(|track| opus_bitrate_for(&track.codec, track.channels, track.bitrate))
        .collect();

    PolicyDecision::Encode(EncodeParams {
        crf,
        preset: inputs.encoder_preset,
        audio_bitrates_kbps,
        pixel_format,
        color,
        skip_audio_transcode: inputs.skip_audio_transcode,
    })
}
