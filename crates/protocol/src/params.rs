//! Encoding parameters produced by the quality policy.

use serde::{Deserialize, Serialize};

/// Color metadata carried through an HDR10 encode.
///
/// Only static HDR10 survives; the mastering-display and content-light
/// strings are forwarded to the encoder verbatim as side data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorParams {
    pub color_primaries: String,
    pub color_transfer: String,
    pub color_space: String,
    pub mastering_display: Option<String>,
    pub content_light_level: Option<String>,
}

impl ColorParams {
    /// Standard HDR10 color signalling with the given side data.
    pub fn hdr10(
        mastering_display: Option<String>,
        content_light_level: Option<String>,
    ) -> Self {
        Self {
            color_primaries: "bt2020".to_string(),
            color_transfer: "smpte2084".to_string(),
            color_space: "bt2020nc".to_string(),
            mastering_display,
            content_light_level,
        }
    }
}

/// Everything the transcoder needs to build the encoder command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParams {
    /// Constant rate factor for the video encoder.
    pub crf: u8,
    /// Encoder preset (speed/quality trade-off).
    pub preset: u8,
    /// Target Opus bitrate in kbps, one entry per source audio stream.
    pub audio_bitrates_kbps: Vec<u32>,
    /// Output pixel format, e.g. "yuv420p" or "yuv420p10le".
    pub pixel_format: String,
    /// HDR10 color signalling; `None` for SDR sources.
    pub color: Option<ColorParams>,
    /// Stream-copy audio instead of transcoding to Opus.
    pub skip_audio_transcode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr10_color_params() {
        let color = ColorParams::hdr10(Some("G(13250,34500)".to_string()), None);
        assert_eq!(color.color_primaries, "bt2020");
        assert_eq!(color.color_transfer, "smpte2084");
        assert_eq!(color.color_space, "bt2020nc");
        assert_eq!(color.mastering_display.as_deref(), Some("G(13250,34500)"));
        assert!(color.content_light_level.is_none());
    }

    #[test]
    fn test_encode_params_serde_shape() {
        let params = EncodeParams {
            crf: 26,
            preset: 8,
            audio_bitrates_kbps: vec![160, 96],
            pixel_format: "yuv420p10le".to_string(),
            color: None,
            skip_audio_transcode: false,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"crf\":26"));
        assert!(json.contains("\"audio_bitrates_kbps\":[160,96]"));
        let back: EncodeParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
