//! Packets and decoded frames: demuxer output, decoder input and output.

use crate::codec::{MediaKind, VideoCodec};
use crate::color::PixelFormat;
use crate::types::{Rational, Resolution};

/// Compressed packet read from a container.
///
/// Timestamps are in the owning stream's time base. `None` marks a missing
/// timestamp (the container's "no PTS/DTS" value).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Elementary stream this packet belongs to.
    pub stream_index: usize,
    /// Presentation timestamp.
    pub pts: Option<i64>,
    /// Decode timestamp.
    pub dts: Option<i64>,
    /// Whether this packet starts a keyframe.
    pub is_keyframe: bool,
    /// Compressed payload.
    pub data: Vec<u8>,
}

/// One plane of a decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Row stride in bytes (may exceed the visible row width).
    pub stride: usize,
}

/// A frame emitted by the decoder, in the codec's native pixel layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Presentation timestamp carried through the decoder, if any.
    pub pts: Option<i64>,
    /// Decode timestamp of the packet this frame came from, if any.
    pub pkt_dts: Option<i64>,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
}

impl DecodedFrame {
    /// Visible row width in bytes and row count of plane `index`.
    pub fn plane_extent(&self, index: usize) -> Option<(usize, usize)> {
        self.format
            .plane_extent(index, self.resolution.width, self.resolution.height)
    }
}

/// Static metadata of one elementary stream, reported at open time.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec: VideoCodec,
    /// Unit of all packet and frame timestamps of this stream.
    pub time_base: Rational,
    /// Average frame rate; zero terms when unknown.
    pub frame_rate: Rational,
    /// Timestamp of the first presentation frame, if the container declares it.
    pub start_time: Option<i64>,
    /// Stream duration in time-base ticks, if declared.
    pub duration: Option<i64>,
    /// Frame count, if declared by the container index.
    pub frame_count: Option<u64>,
    /// Frames the decoder holds back before emitting output (B-frame depth).
    pub reorder_depth: u32,
    pub resolution: Resolution,
    /// Native layout of decoded frames.
    pub pixel_format: PixelFormat,
    /// Sample (pixel) aspect ratio; zero terms when unknown.
    pub sample_aspect: Rational,
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Pixel aspect ratio as a float, treating unknown as square pixels.
    pub fn pixel_aspect_ratio(&self) -> f64 {
        if self.sample_aspect.is_valid() {
            self.sample_aspect.as_f64()
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec: VideoCodec::H264,
            time_base: Rational::TB_90K,
            frame_rate: Rational::FPS_24,
            start_time: None,
            duration: None,
            frame_count: None,
            reorder_depth: 2,
            resolution: Resolution::new(720, 576),
            pixel_format: PixelFormat::Yuv420p,
            sample_aspect: Rational { num: 0, den: 1 },
        }
    }

    #[test]
    fn unknown_aspect_is_square() {
        assert!((info().pixel_aspect_ratio() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn declared_aspect_is_used() {
        let mut i = info();
        i.sample_aspect = Rational::new(16, 15);
        assert!((i.pixel_aspect_ratio() - 16.0 / 15.0).abs() < 1e-12);
        assert!(i.is_video());
    }

    #[test]
    fn frame_plane_extent() {
        let frame = DecodedFrame {
            pts: Some(0),
            pkt_dts: None,
            resolution: Resolution::new(4, 2),
            format: PixelFormat::Nv12,
            planes: Vec::new(),
        };
        assert_eq!(frame.plane_extent(0), Some((4, 2)));
        assert_eq!(frame.plane_extent(1), Some((4, 1)));
        assert_eq!(frame.plane_extent(2), None);
    }
}
