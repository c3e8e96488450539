//! In-memory packet table demuxer.
//!
//! Holds every packet of a "container" in file order (streams interleaved)
//! and serves them through the [`Demuxer`] trait. Seeking uses the same rule
//! as a sample-table index: the last keyframe of the stream whose
//! presentation timestamp (decode timestamp when absent) is at or before the
//! target.

use tracing::debug;

use se_common::{
    BackendError, FailureKind, FrameDecoder, OpenError, Packet, Stage, StreamInfo,
};

use crate::traits::Demuxer;

/// Builds a decoder for one stream of a [`MemoryDemuxer`].
pub type DecoderFactory =
    Box<dyn Fn(&StreamInfo) -> Result<Box<dyn FrameDecoder>, OpenError> + Send>;

/// Demuxer over a packet list held in memory.
pub struct MemoryDemuxer {
    streams: Vec<StreamInfo>,
    /// All packets in file order.
    packets: Vec<Packet>,
    /// Index of the next packet `read_packet` returns.
    position: usize,
    factory: Option<DecoderFactory>,
}

impl std::fmt::Debug for MemoryDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDemuxer")
            .field("streams", &self.streams.len())
            .field("packets", &self.packets.len())
            .field("position", &self.position)
            .field("has_decoder_factory", &self.factory.is_some())
            .finish()
    }
}

impl MemoryDemuxer {
    pub fn new(streams: Vec<StreamInfo>, packets: Vec<Packet>) -> Self {
        Self {
            streams,
            packets,
            position: 0,
            factory: None,
        }
    }

    /// Attach the factory used by [`Demuxer::open_decoder`].
    pub fn with_decoder_factory(mut self, factory: DecoderFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Index of the next packet to be read.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Find the keyframe packet of `stream_index` at or before `timestamp`.
    ///
    /// Returns the packet's position in file order, or `None` if the stream
    /// has no keyframe that early.
    pub fn find_keyframe_at_or_before(&self, stream_index: usize, timestamp: i64) -> Option<usize> {
        // Timestamps are not monotonic in file order once frames reorder, so
        // the whole table is scanned.
        let mut best: Option<usize> = None;
        for (i, p) in self.packets.iter().enumerate() {
            if p.stream_index != stream_index || !p.is_keyframe {
                continue;
            }
            match p.pts.or(p.dts) {
                Some(ts) if ts <= timestamp => best = Some(i),
                _ => {}
            }
        }
        best
    }

    fn first_packet_of(&self, stream_index: usize) -> usize {
        self.packets
            .iter()
            .position(|p| p.stream_index == stream_index)
            .unwrap_or(0)
    }
}

impl Demuxer for MemoryDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, BackendError> {
        let packet = self.packets.get(self.position).cloned();
        if packet.is_some() {
            self.position += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), BackendError> {
        if self.stream(stream_index).is_none() {
            return Err(BackendError::new(
                Stage::Seek,
                FailureKind::Other,
                format!("no stream with index {stream_index}"),
            ));
        }

        self.position = match self.find_keyframe_at_or_before(stream_index, timestamp) {
            Some(idx) => idx,
            None => self.first_packet_of(stream_index),
        };
        debug!(
            stream = stream_index,
            timestamp,
            position = self.position,
            "Memory demuxer seek"
        );
        Ok(())
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn FrameDecoder>, OpenError> {
        let info = self
            .stream(stream_index)
            .ok_or(OpenError::StreamNotFound {
                stream: stream_index,
            })?;
        match &self.factory {
            Some(factory) => factory(info),
            None => Err(OpenError::UnsupportedCodec {
                stream: stream_index,
                codec: info.codec,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use se_common::{MediaKind, PixelFormat, Rational, Resolution, VideoCodec};

    fn stream(index: usize, kind: MediaKind) -> StreamInfo {
        StreamInfo {
            index,
            kind,
            codec: VideoCodec::H264,
            time_base: Rational::new(1, 24),
            frame_rate: Rational::FPS_24,
            start_time: Some(0),
            duration: None,
            frame_count: None,
            reorder_depth: 0,
            resolution: Resolution::new(4, 2),
            pixel_format: PixelFormat::Nv12,
            sample_aspect: Rational::new(1, 1),
        }
    }

    fn packet(stream_index: usize, pts: i64, is_keyframe: bool) -> Packet {
        Packet {
            stream_index,
            pts: Some(pts),
            dts: Some(pts),
            is_keyframe,
            data: vec![pts as u8],
        }
    }

    /// Video keyframes every 4 frames, an audio packet after each video packet.
    fn demuxer() -> MemoryDemuxer {
        let mut packets = Vec::new();
        for f in 0..12 {
            packets.push(packet(0, f, f % 4 == 0));
            packets.push(packet(1, f, true));
        }
        MemoryDemuxer::new(
            vec![stream(0, MediaKind::Video), stream(1, MediaKind::Audio)],
            packets,
        )
    }

    #[test]
    fn reads_in_file_order_then_eof() {
        let mut d = demuxer();
        let mut count = 0;
        while let Some(p) = d.read_packet().unwrap() {
            count += 1;
            assert!(p.stream_index <= 1);
        }
        assert_eq!(count, 24);
        assert!(d.read_packet().unwrap().is_none());
    }

    #[test]
    fn seek_lands_on_keyframe_at_or_before() {
        let mut d = demuxer();
        d.seek(0, 6).unwrap();
        let p = d.read_packet().unwrap().unwrap();
        assert_eq!(p.stream_index, 0);
        assert_eq!(p.pts, Some(4));
        assert!(p.is_keyframe);

        d.seek(0, 8).unwrap();
        assert_eq!(d.read_packet().unwrap().unwrap().pts, Some(8));
    }

    #[test]
    fn seek_before_first_keyframe_rewinds() {
        let mut d = demuxer();
        d.seek(0, 100).unwrap();
        d.seek(0, -5).unwrap();
        assert_eq!(d.position(), 0);
    }

    #[test]
    fn seek_unknown_stream_fails() {
        let mut d = demuxer();
        let err = d.seek(7, 0).unwrap_err();
        assert_eq!(err.stage, Stage::Seek);
    }

    #[test]
    fn open_decoder_without_factory_is_unsupported() {
        let mut d = demuxer();
        assert!(matches!(
            d.open_decoder(0),
            Err(OpenError::UnsupportedCodec { stream: 0, .. })
        ));
        assert!(matches!(
            d.open_decoder(9),
            Err(OpenError::StreamNotFound { stream: 9 })
        ));
    }
}
