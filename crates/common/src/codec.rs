//! Codec and elementary-stream kind identifiers.

use serde::{Deserialize, Serialize};

/// Video codec identifier as reported by the container collaborator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
    ProRes,
    Mpeg2,
    Mpeg4,
    Mjpeg,
    DnxHd,
    /// Uncompressed or intra-only raw video.
    RawVideo,
    /// Codec the engine has no name for; decoding is still delegated.
    Unknown,
}

impl VideoCodec {
    /// Human-readable name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
            Self::ProRes => "Apple ProRes",
            Self::Mpeg2 => "MPEG-2 Video",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::Mjpeg => "Motion JPEG",
            Self::DnxHd => "DNxHD/DNxHR",
            Self::RawVideo => "raw video",
            Self::Unknown => "unknown",
        }
    }

    /// Codecs whose every frame is a keyframe never reorder output.
    pub fn is_intra_only(self) -> bool {
        matches!(
            self,
            Self::ProRes | Self::Mjpeg | Self::DnxHd | Self::RawVideo
        )
    }
}

/// Kind of elementary stream inside a container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(VideoCodec::H265.display_name(), "H.265/HEVC");
    }

    #[test]
    fn intra_only_codecs() {
        assert!(VideoCodec::ProRes.is_intra_only());
        assert!(!VideoCodec::H264.is_intra_only());
    }
}
