//! Deterministic synthetic clips for driving the engine without a codec
//! library.
//!
//! A [`SyntheticClip`] describes a video stream (frame count, rate, GOP
//! length, B-frame reorder depth, which timestamps the container carries)
//! and produces:
//!
//! - a packet table in decode order, served by a [`MemoryDemuxer`] with
//!   keyframe-index seeking ([`SyntheticDemuxer`]),
//! - a [`SyntheticDecoder`] that reorders packets back into presentation
//!   order with exactly `reorder_depth` frames of latency,
//! - frame content that is a pure function of the frame index, so every
//!   delivered buffer can be checked byte for byte
//!   ([`SyntheticClip::expected_rgba`]).
//!
//! Faults can be injected: a decoder that never emits, corrupt packets,
//! failing seeks, and seeks that land one GOP late.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use se_common::{
    BackendError, DecodedFrame, FailureKind, FrameDecoder, MediaKind, OpenError, Packet,
    PixelFormat, Plane, Rational, Resolution, Stage, StreamInfo, VideoCodec,
};
use se_demux::{Demuxer, MediaOpener, MemoryDemuxer};

/// Padding appended to every decoded row, so converters must honour strides.
const ROW_PADDING: usize = 8;
const PADDING_BYTE: u8 = 0xEE;

/// Which timestamps the synthetic container writes on its packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimestampMode {
    /// PTS and DTS on every packet.
    Reliable,
    /// DTS only.
    DtsOnly,
    /// No timestamps at all.
    Missing,
}

/// How the synthetic decoder responds to input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderBehavior {
    Normal,
    /// Accepts every packet and never produces a frame.
    Silent,
}

/// Description of a synthetic video clip.
#[derive(Clone, Debug)]
pub struct SyntheticClip {
    pub frames: u64,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// Keyframe interval in frames.
    pub gop: u64,
    pub reorder_depth: u32,
    pub resolution: Resolution,
    pub timestamps: TimestampMode,
    /// Presentation timestamp of frame 0.
    pub start_pts: i64,
    /// Frame count written to the stream metadata.
    pub declared_frame_count: Option<u64>,
    /// Whether the stream metadata carries a duration.
    pub declare_duration: bool,
    /// Interleave an audio packet after every video packet.
    pub with_audio: bool,
    pub behavior: DecoderBehavior,
    /// Frames whose packets the decoder rejects as corrupt.
    pub corrupt_frames: Vec<u64>,
    /// Number of initial seeks that fail outright.
    pub failing_seeks: u32,
    /// Number of initial seeks that land on the keyframe after the target's.
    pub late_seeks: u32,
}

impl SyntheticClip {
    /// A 24 fps, 1/90000 time base clip with 12-frame GOPs, no reordering,
    /// full timestamps and a declared frame count.
    pub fn new(frames: u64) -> Self {
        Self {
            frames,
            frame_rate: Rational::FPS_24,
            time_base: Rational::TB_90K,
            gop: 12,
            reorder_depth: 0,
            resolution: Resolution::new(16, 8),
            timestamps: TimestampMode::Reliable,
            start_pts: 0,
            declared_frame_count: Some(frames),
            declare_duration: false,
            with_audio: false,
            behavior: DecoderBehavior::Normal,
            corrupt_frames: Vec::new(),
            failing_seeks: 0,
            late_seeks: 0,
        }
    }

    pub fn with_reorder_depth(mut self, depth: u32) -> Self {
        self.reorder_depth = depth;
        self
    }

    pub fn with_gop(mut self, gop: u64) -> Self {
        self.gop = gop.max(1);
        self
    }

    pub fn with_timestamps(mut self, mode: TimestampMode) -> Self {
        self.timestamps = mode;
        self
    }

    pub fn with_start_pts(mut self, start_pts: i64) -> Self {
        self.start_pts = start_pts;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Metadata: frame count (or none) and whether a duration is declared.
    pub fn with_metadata(mut self, frame_count: Option<u64>, duration: bool) -> Self {
        self.declared_frame_count = frame_count;
        self.declare_duration = duration;
        self
    }

    pub fn with_audio(mut self) -> Self {
        self.with_audio = true;
        self
    }

    pub fn with_behavior(mut self, behavior: DecoderBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_corrupt_frames(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.corrupt_frames = frames.into_iter().collect();
        self
    }

    pub fn with_failing_seeks(mut self, count: u32) -> Self {
        self.failing_seeks = count;
        self
    }

    pub fn with_late_seeks(mut self, count: u32) -> Self {
        self.late_seeks = count;
        self
    }

    /// Time-base ticks per frame. Exact for the rate/time-base pairs used
    /// with synthetic clips.
    pub fn ticks_per_frame(&self) -> i64 {
        (self.time_base.den as i64 * self.frame_rate.den as i64)
            / (self.time_base.num as i64 * self.frame_rate.num as i64).max(1)
    }

    pub fn pts_of(&self, frame: u64) -> i64 {
        self.start_pts + frame as i64 * self.ticks_per_frame()
    }

    /// Frame indices in decode order: each GOP starts with its keyframe,
    /// then every anchor frame precedes the `reorder_depth` frames it
    /// references.
    pub fn decode_order(&self) -> Vec<u64> {
        let depth = self.reorder_depth as u64;
        let mut order = Vec::with_capacity(self.frames as usize);
        let mut gop_start = 0;
        while gop_start < self.frames {
            let gop_end = (gop_start + self.gop).min(self.frames);
            order.push(gop_start);
            let mut prev = gop_start;
            while prev + 1 < gop_end {
                let anchor = (prev + depth + 1).min(gop_end - 1);
                order.push(anchor);
                order.extend(prev + 1..anchor);
                prev = anchor;
            }
            gop_start = gop_end;
        }
        order
    }

    /// Packet table in file order.
    pub fn packets(&self) -> Vec<Packet> {
        let tpf = self.ticks_per_frame();
        let depth = self.reorder_depth as i64;
        let mut packets = Vec::new();
        for (position, frame) in self.decode_order().into_iter().enumerate() {
            let pts = self.pts_of(frame);
            let dts = self.start_pts + (position as i64 - depth) * tpf;
            let (pts, dts) = match self.timestamps {
                TimestampMode::Reliable => (Some(pts), Some(dts)),
                TimestampMode::DtsOnly => (None, Some(dts)),
                TimestampMode::Missing => (None, None),
            };
            packets.push(Packet {
                stream_index: 0,
                pts,
                dts,
                is_keyframe: frame % self.gop == 0,
                data: frame.to_le_bytes().to_vec(),
            });
            if self.with_audio {
                let ts = self.start_pts + position as i64 * tpf;
                packets.push(Packet {
                    stream_index: 1,
                    pts: Some(ts),
                    dts: Some(ts),
                    is_keyframe: true,
                    data: Vec::new(),
                });
            }
        }
        packets
    }

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        let has_pts = self.timestamps == TimestampMode::Reliable;
        let mut streams = vec![StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec: VideoCodec::RawVideo,
            time_base: self.time_base,
            frame_rate: self.frame_rate,
            start_time: has_pts.then_some(self.start_pts),
            duration: self
                .declare_duration
                .then(|| self.frames as i64 * self.ticks_per_frame()),
            frame_count: self.declared_frame_count,
            reorder_depth: self.reorder_depth,
            resolution: self.resolution,
            pixel_format: PixelFormat::Rgba8,
            sample_aspect: Rational::new(1, 1),
        }];
        if self.with_audio {
            streams.push(StreamInfo {
                index: 1,
                kind: MediaKind::Audio,
                codec: VideoCodec::Unknown,
                time_base: self.time_base,
                frame_rate: Rational { num: 0, den: 1 },
                start_time: Some(self.start_pts),
                duration: None,
                frame_count: None,
                reorder_depth: 0,
                resolution: Resolution::new(0, 0),
                pixel_format: PixelFormat::Gray8,
                sample_aspect: Rational { num: 0, den: 1 },
            });
        }
        streams
    }

    /// Tightly packed RGBA8 content of presentation frame `frame`.
    pub fn expected_rgba(&self, frame: u64) -> Vec<u8> {
        frame_pixels(self.resolution, frame, 0)
    }

    /// Open the clip as a container.
    pub fn demuxer(&self) -> SyntheticDemuxer {
        let resolution = self.resolution;
        let depth = self.reorder_depth;
        let behavior = self.behavior;
        let corrupt: HashSet<u64> = self.corrupt_frames.iter().copied().collect();
        let inner = MemoryDemuxer::new(self.stream_infos(), self.packets()).with_decoder_factory(
            Box::new(move |info: &StreamInfo| {
                if !info.is_video() {
                    return Err(OpenError::UnsupportedCodec {
                        stream: info.index,
                        codec: info.codec,
                    });
                }
                Ok(Box::new(SyntheticDecoder::new(
                    resolution,
                    depth,
                    behavior,
                    corrupt.clone(),
                )) as Box<dyn FrameDecoder>)
            }),
        );
        SyntheticDemuxer {
            inner,
            clip: self.clone(),
            failing_seeks_left: self.failing_seeks,
            late_seeks_left: self.late_seeks,
        }
    }
}

/// RGBA8 pattern of frame `frame`, with `padding` extra bytes per row.
fn frame_pixels(resolution: Resolution, frame: u64, padding: usize) -> Vec<u8> {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    let stride = w * 4 + padding;
    let mut data = vec![PADDING_BYTE; stride * h];
    for y in 0..h {
        for x in 0..w {
            let i = y * stride + x * 4;
            data[i] = frame as u8;
            data[i + 1] = (frame >> 8) as u8;
            data[i + 2] = (x + y * w) as u8;
            data[i + 3] = 0xFF;
        }
    }
    data
}

// ---------------------------------------------------------------------------
// SyntheticDecoder
// ---------------------------------------------------------------------------

/// Reordering decoder for synthetic packets.
///
/// A packet's payload is its presentation frame index. Frames are held in a
/// reorder buffer and the smallest index is released once more than
/// `depth` frames are buffered. A released frame carries the DTS of the
/// packet that released it; frames released by the end-of-stream drain
/// carry none. After a flush, packets are dropped until the next keyframe.
#[derive(Debug)]
pub struct SyntheticDecoder {
    resolution: Resolution,
    depth: usize,
    behavior: DecoderBehavior,
    corrupt: HashSet<u64>,
    pending: BTreeMap<u64, DecodedFrame>,
    ready: VecDeque<DecodedFrame>,
    awaiting_keyframe: bool,
}

impl SyntheticDecoder {
    pub fn new(
        resolution: Resolution,
        depth: u32,
        behavior: DecoderBehavior,
        corrupt: HashSet<u64>,
    ) -> Self {
        Self {
            resolution,
            depth: depth as usize,
            behavior,
            corrupt,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            awaiting_keyframe: true,
        }
    }

    fn frame_index(packet: &Packet) -> Result<u64, BackendError> {
        let bytes: [u8; 8] = packet.data.as_slice().try_into().map_err(|_| {
            BackendError::new(
                Stage::SendPacket,
                FailureKind::InvalidData,
                format!("payload of {} bytes", packet.data.len()),
            )
        })?;
        Ok(u64::from_le_bytes(bytes))
    }
}

impl FrameDecoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        let index = Self::frame_index(packet)?;
        if self.corrupt.contains(&index) {
            return Err(BackendError::new(
                Stage::SendPacket,
                FailureKind::InvalidData,
                format!("corrupt packet for frame {index}"),
            ));
        }
        if self.awaiting_keyframe && !packet.is_keyframe {
            return Ok(());
        }
        self.awaiting_keyframe = false;
        if self.behavior == DecoderBehavior::Silent {
            return Ok(());
        }

        let w = self.resolution.width as usize;
        let frame = DecodedFrame {
            pts: packet.pts,
            pkt_dts: None,
            resolution: self.resolution,
            format: PixelFormat::Rgba8,
            planes: vec![Plane {
                data: frame_pixels(self.resolution, index, ROW_PADDING),
                stride: w * 4 + ROW_PADDING,
            }],
        };
        self.pending.insert(index, frame);
        if self.pending.len() > self.depth {
            if let Some((_, mut frame)) = self.pending.pop_first() {
                frame.pkt_dts = packet.dts;
                self.ready.push_back(frame);
            }
        }
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), BackendError> {
        while let Some((_, frame)) = self.pending.pop_first() {
            self.ready.push_back(frame);
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, BackendError> {
        Ok(self.ready.pop_front())
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.awaiting_keyframe = true;
    }

    fn delay_frames(&self) -> u32 {
        self.depth as u32
    }
}

// ---------------------------------------------------------------------------
// SyntheticDemuxer
// ---------------------------------------------------------------------------

/// [`MemoryDemuxer`] over a synthetic clip, with seek fault injection.
#[derive(Debug)]
pub struct SyntheticDemuxer {
    inner: MemoryDemuxer,
    clip: SyntheticClip,
    failing_seeks_left: u32,
    late_seeks_left: u32,
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        self.inner.streams()
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, BackendError> {
        self.inner.read_packet()
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), BackendError> {
        if self.failing_seeks_left > 0 {
            self.failing_seeks_left -= 1;
            return Err(BackendError::new(
                Stage::Seek,
                FailureKind::Io,
                "injected seek failure",
            ));
        }
        if self.late_seeks_left > 0 && self.clip.timestamps != TimestampMode::Missing {
            self.late_seeks_left -= 1;
            let tpf = self.clip.ticks_per_frame().max(1);
            let frame = ((timestamp - self.clip.start_pts) / tpf).max(0) as u64;
            let next_key = (frame / self.clip.gop + 1) * self.clip.gop;
            if next_key < self.clip.frames {
                return self.inner.seek(stream_index, self.clip.pts_of(next_key));
            }
        }
        self.inner.seek(stream_index, timestamp)
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn FrameDecoder>, OpenError> {
        self.inner.open_decoder(stream_index)
    }
}

// ---------------------------------------------------------------------------
// SyntheticOpener
// ---------------------------------------------------------------------------

/// Opens registered synthetic clips by path and counts open calls.
#[derive(Debug, Default)]
pub struct SyntheticOpener {
    clips: HashMap<PathBuf, SyntheticClip>,
    opens: AtomicUsize,
    open_delay: Duration,
}

impl SyntheticOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clip(mut self, path: impl Into<PathBuf>, clip: SyntheticClip) -> Self {
        self.clips.insert(path.into(), clip);
        self
    }

    /// Sleep inside every open call, widening race windows in tests.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Number of `open` calls so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl MediaOpener for SyntheticOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        match self.clips.get(path) {
            Some(clip) => Ok(Box::new(clip.demuxer())),
            None => Err(OpenError::NotFound {
                path: path.display().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SyntheticDecoder) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(f) = decoder.receive_frame().unwrap() {
            out.push(f.planes[0].data[0] as u64 | (f.planes[0].data[1] as u64) << 8);
        }
        out
    }

    #[test]
    fn decode_order_with_reordering() {
        let clip = SyntheticClip::new(12).with_reorder_depth(2);
        assert_eq!(
            clip.decode_order(),
            vec![0, 3, 1, 2, 6, 4, 5, 9, 7, 8, 11, 10]
        );
        let flat = SyntheticClip::new(5).with_gop(3);
        assert_eq!(flat.decode_order(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn decoder_restores_presentation_order_with_fixed_latency() {
        let clip = SyntheticClip::new(30).with_reorder_depth(2);
        let mut decoder =
            SyntheticDecoder::new(clip.resolution, 2, DecoderBehavior::Normal, HashSet::new());
        let mut emitted = Vec::new();
        for (fed, packet) in clip.packets().iter().enumerate() {
            decoder.send_packet(packet).unwrap();
            let out = drain(&mut decoder);
            if fed < 2 {
                assert!(out.is_empty());
            }
            emitted.extend(out);
        }
        decoder.send_eof().unwrap();
        emitted.extend(drain(&mut decoder));
        assert_eq!(emitted, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn decoder_waits_for_keyframe_after_flush() {
        let clip = SyntheticClip::new(24);
        let packets = clip.packets();
        let mut decoder =
            SyntheticDecoder::new(clip.resolution, 0, DecoderBehavior::Normal, HashSet::new());
        decoder.send_packet(&packets[5]).unwrap();
        assert!(drain(&mut decoder).is_empty());
        decoder.send_packet(&packets[12]).unwrap();
        assert_eq!(drain(&mut decoder), vec![12]);
    }

    #[test]
    fn corrupt_packets_are_rejected() {
        let clip = SyntheticClip::new(4).with_corrupt_frames([0]);
        let mut decoder = SyntheticDecoder::new(
            clip.resolution,
            0,
            DecoderBehavior::Normal,
            [0].into_iter().collect(),
        );
        let err = decoder.send_packet(&clip.packets()[0]).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidData);
    }

    #[test]
    fn timestamp_modes_shape_packets() {
        let dts_only = SyntheticClip::new(3).with_timestamps(TimestampMode::DtsOnly);
        assert!(dts_only
            .packets()
            .iter()
            .all(|p| p.pts.is_none() && p.dts.is_some()));
        let missing = SyntheticClip::new(3).with_timestamps(TimestampMode::Missing);
        assert!(missing
            .packets()
            .iter()
            .all(|p| p.pts.is_none() && p.dts.is_none()));
        assert_eq!(missing.stream_infos()[0].start_time, None);
    }

    #[test]
    fn late_seek_lands_on_next_keyframe() {
        let clip = SyntheticClip::new(48).with_late_seeks(1);
        let mut demuxer = clip.demuxer();
        demuxer.seek(0, clip.pts_of(14)).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, Some(clip.pts_of(24)));
        demuxer.seek(0, clip.pts_of(14)).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, Some(clip.pts_of(12)));
    }

    #[test]
    fn opener_counts_calls() {
        let opener = SyntheticOpener::new().with_clip("/clips/a.mov", SyntheticClip::new(4));
        assert!(opener.open(Path::new("/clips/a.mov")).is_ok());
        assert!(matches!(
            opener.open(Path::new("/clips/b.mov")),
            Err(OpenError::NotFound { .. })
        ));
        assert_eq!(opener.open_count(), 2);
    }
}
