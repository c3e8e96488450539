//! Per-stream decode state: timestamp ↔ frame mapping, the read cursor and
//! decode-latency accounting.
//!
//! A [`StreamState`] never touches the container or the codec. The session
//! drives it with notifications (`note_fed`, `note_emitted`, seeks) and asks
//! it the questions the decode loop needs answered: where is frame N on the
//! time axis, which frame did this output carry, must we seek, are we stalled.
//!
//! All timestamp arithmetic runs in 128-bit integers so large time bases
//! (1/90000, 1/1000000) and long streams cannot overflow.

use se_common::types::div_round;
use se_common::{DecodedFrame, FrameNumber, Rational, Resolution, StreamInfo, VideoCodec};

/// Where the presentation position of a decoded frame is read from.
///
/// Resolved once per stream at open time and fixed for the stream's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimestampSource {
    /// Presentation timestamps are present and trusted.
    Pts,
    /// Only decode timestamps are usable. Output frames carry the DTS of the
    /// packet that released them, which runs `reorder_depth` frames behind
    /// the packet DTS of the same frame.
    Dts,
    /// No usable timestamps: frames are counted from the stream start.
    FrameCounter,
}

/// Position of the decode cursor relative to the container read position.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CursorState {
    /// Nothing known; the next request must seek.
    Uninitialized,
    /// A seek was issued and no output has been observed since.
    Seeking,
    /// The index of the next emitted frame is known.
    Sequential,
    /// The last attempt fed packets without output beyond the latency budget.
    Stalled,
}

/// Decode state of one video stream of a session.
#[derive(Clone, Debug)]
pub struct StreamState {
    stream_index: usize,
    codec: VideoCodec,
    resolution: Resolution,
    pixel_aspect: f64,
    frame_rate: Rational,
    time_base: Rational,
    /// Timestamp of frame 0; set once.
    start_timestamp: Option<i64>,
    frame_count: u64,
    timestamp_source: TimestampSource,
    codec_delay: u32,
    reorder_depth: u32,

    cursor: CursorState,
    next_frame_to_feed: Option<u64>,
    next_frame_expected_out: Option<u64>,
    /// Packets fed since the last emitted frame (or since the last seek).
    accumulated_latency_frames: u64,
    /// Packets fed since the last seek minus frames emitted since then.
    in_flight: u64,
    /// End of input was signalled to the decoder since the last flush.
    eof_sent: bool,
}

impl StreamState {
    /// Build the state for a video stream.
    ///
    /// `frame_rate` is the container's declared rate, already validated by
    /// the caller. The timestamp source starts
    /// as [`TimestampSource::Pts`] until the open-time probe decides.
    pub fn new(info: &StreamInfo, frame_rate: Rational, codec_delay: u32) -> Self {
        Self {
            stream_index: info.index,
            codec: info.codec,
            resolution: info.resolution,
            pixel_aspect: info.pixel_aspect_ratio(),
            frame_rate,
            time_base: info.time_base,
            start_timestamp: None,
            frame_count: 0,
            timestamp_source: TimestampSource::Pts,
            codec_delay,
            reorder_depth: info.reorder_depth,
            cursor: CursorState::Uninitialized,
            next_frame_to_feed: None,
            next_frame_expected_out: None,
            accumulated_latency_frames: 0,
            in_flight: 0,
            eof_sent: false,
        }
    }

    // -----------------------------------------------------------------------
    // Static properties
    // -----------------------------------------------------------------------

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn pixel_aspect_ratio(&self) -> f64 {
        self.pixel_aspect
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn set_frame_count(&mut self, frames: u64) {
        self.frame_count = frames;
    }

    /// Frames the codec holds back before emitting output.
    pub fn codec_delay_frames(&self) -> u64 {
        self.codec_delay as u64
    }

    pub fn timestamp_source(&self) -> TimestampSource {
        self.timestamp_source
    }

    pub fn set_timestamp_source(&mut self, source: TimestampSource) {
        self.timestamp_source = source;
    }

    /// Whether frame positions come from container timestamps.
    pub fn timestamp_is_reliable(&self) -> bool {
        self.timestamp_source != TimestampSource::FrameCounter
    }

    pub fn start_timestamp(&self) -> Option<i64> {
        self.start_timestamp
    }

    /// Record the timestamp of frame 0. Only the first call has an effect.
    ///
    /// Returns `true` if this call set the value.
    pub fn establish_start_timestamp(&mut self, timestamp: i64) -> bool {
        if self.start_timestamp.is_some() {
            return false;
        }
        self.start_timestamp = Some(timestamp);
        true
    }

    // -----------------------------------------------------------------------
    // Timestamp ↔ frame mapping
    // -----------------------------------------------------------------------

    /// Container timestamp of presentation frame `frame`, rounded to the
    /// nearest tick.
    pub fn frame_to_timestamp(&self, frame: FrameNumber) -> i64 {
        let start = self.start_timestamp.unwrap_or(0) as i128;
        clamp_i64(start + self.frames_to_ticks(frame.get()))
    }

    /// Length of `frames` frames in time-base ticks, rounded to the nearest
    /// tick.
    fn frames_to_ticks(&self, frames: u64) -> i128 {
        let num = frames as i128 * self.frame_rate.den as i128 * self.time_base.den as i128;
        let den = self.frame_rate.num as i128 * self.time_base.num as i128;
        if den == 0 {
            return 0;
        }
        div_round(num, den)
    }

    /// Distance between a packet's DTS and the DTS stamped on its frame when
    /// it leaves the decoder. Zero outside [`TimestampSource::Dts`].
    pub fn dts_lead_ticks(&self) -> i64 {
        match self.timestamp_source {
            TimestampSource::Dts => clamp_i64(self.frames_to_ticks(self.reorder_depth as u64)),
            _ => 0,
        }
    }

    /// Container timestamp to seek to for `frame`: its presentation
    /// timestamp, or in DTS mode the DTS its keyframe search must compare
    /// against.
    pub fn seek_timestamp(&self, frame: FrameNumber) -> i64 {
        self.frame_to_timestamp(frame).saturating_sub(self.dts_lead_ticks())
    }

    /// Presentation frame at `timestamp`, rounded to the nearest frame.
    /// Timestamps before the stream start map to frame 0.
    pub fn timestamp_to_frame(&self, timestamp: i64) -> FrameNumber {
        let rel = timestamp as i128 - self.start_timestamp.unwrap_or(0) as i128;
        if rel <= 0 {
            return FrameNumber::ZERO;
        }
        let num = rel * self.time_base.num as i128 * self.frame_rate.num as i128;
        let den = self.time_base.den as i128 * self.frame_rate.den as i128;
        if den == 0 {
            return FrameNumber::ZERO;
        }
        FrameNumber(div_round(num, den).clamp(0, u64::MAX as i128) as u64)
    }

    /// Presentation index of a decoded frame.
    ///
    /// Timestamp modes read the chosen field; when it is missing, or in
    /// frame-counter mode, the frame is assumed to be the next expected one.
    /// `None` means the frame cannot be placed (no timestamp and no known
    /// cursor).
    pub fn frame_index_of(&self, frame: &DecodedFrame) -> Option<FrameNumber> {
        let ts = match self.timestamp_source {
            TimestampSource::Pts => frame.pts,
            TimestampSource::Dts => frame.pkt_dts,
            TimestampSource::FrameCounter => None,
        };
        match ts {
            Some(ts) => Some(self.timestamp_to_frame(ts)),
            None => self.next_frame_expected_out.map(FrameNumber),
        }
    }

    // -----------------------------------------------------------------------
    // Cursor
    // -----------------------------------------------------------------------

    pub fn cursor(&self) -> CursorState {
        self.cursor
    }

    pub fn next_frame_to_feed(&self) -> Option<u64> {
        self.next_frame_to_feed
    }

    pub fn next_frame_expected_out(&self) -> Option<u64> {
        self.next_frame_expected_out
    }

    pub fn accumulated_latency_frames(&self) -> u64 {
        self.accumulated_latency_frames
    }

    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    pub fn note_eof_sent(&mut self) {
        self.eof_sent = true;
    }

    /// Whether reaching `target` needs a seek rather than reading ahead.
    ///
    /// Without reliable timestamps a seek rewinds to the stream start, so a
    /// forward target is always read ahead to, however far away it is.
    pub fn needs_seek(&self, target: FrameNumber, forward_scan_frames: u64) -> bool {
        match self.cursor {
            CursorState::Uninitialized | CursorState::Stalled => true,
            CursorState::Seeking | CursorState::Sequential => match self.next_frame_expected_out {
                None => true,
                Some(next) if target.get() < next => true,
                Some(next) => {
                    self.timestamp_is_reliable() && target.get() - next > forward_scan_frames
                }
            },
        }
    }

    /// A container seek was issued and the decoder flushed.
    pub fn note_seek(&mut self) {
        self.cursor = CursorState::Seeking;
        self.next_frame_to_feed = None;
        self.next_frame_expected_out = None;
        self.reset_counters();
    }

    /// The container was rewound to the first packet of the stream; the
    /// cursor is re-synchronized at frame 0.
    pub fn note_rewound(&mut self) {
        self.cursor = CursorState::Seeking;
        self.next_frame_to_feed = Some(0);
        self.next_frame_expected_out = Some(0);
        self.reset_counters();
    }

    /// One packet of this stream went to the decoder.
    pub fn note_fed(&mut self) {
        if let Some(next) = self.next_frame_to_feed.as_mut() {
            *next += 1;
        }
        self.accumulated_latency_frames += 1;
        self.in_flight += 1;
    }

    /// The decoder emitted presentation frame `index`.
    pub fn note_emitted(&mut self, index: FrameNumber) {
        self.accumulated_latency_frames = 0;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.next_frame_expected_out = Some(index.get() + 1);
        if self.next_frame_to_feed.is_none() {
            self.next_frame_to_feed = Some(index.get() + 1 + self.in_flight);
        }
        self.cursor = CursorState::Sequential;
    }

    /// Accumulated latency exceeds the codec delay plus `margin`.
    pub fn is_stalled(&self, margin: u64) -> bool {
        self.accumulated_latency_frames > self.stall_budget(margin)
    }

    pub fn stall_budget(&self, margin: u64) -> u64 {
        self.codec_delay_frames() + margin
    }

    pub fn note_stalled(&mut self) {
        self.cursor = CursorState::Stalled;
    }

    /// Forget the cursor; the next request seeks.
    pub fn invalidate(&mut self) {
        self.cursor = CursorState::Uninitialized;
        self.next_frame_to_feed = None;
        self.next_frame_expected_out = None;
        self.reset_counters();
    }

    fn reset_counters(&mut self) {
        self.accumulated_latency_frames = 0;
        self.in_flight = 0;
        self.eof_sent = false;
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use se_common::{MediaKind, PixelFormat};

    fn info(time_base: Rational) -> StreamInfo {
        StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec: VideoCodec::H264,
            time_base,
            frame_rate: Rational::FPS_24,
            start_time: None,
            duration: None,
            frame_count: None,
            reorder_depth: 2,
            resolution: Resolution::new(8, 4),
            pixel_format: PixelFormat::Nv12,
            sample_aspect: Rational::new(1, 1),
        }
    }

    fn state(time_base: Rational, fps: Rational, start: i64) -> StreamState {
        let mut s = StreamState::new(&info(time_base), fps, 2);
        s.establish_start_timestamp(start);
        s
    }

    fn frame(pts: Option<i64>, dts: Option<i64>) -> DecodedFrame {
        DecodedFrame {
            pts,
            pkt_dts: dts,
            resolution: Resolution::new(8, 4),
            format: PixelFormat::Rgba8,
            planes: Vec::new(),
        }
    }

    #[test]
    fn mapping_24fps_90k() {
        let s = state(Rational::TB_90K, Rational::FPS_24, 0);
        assert_eq!(s.frame_to_timestamp(FrameNumber(0)), 0);
        assert_eq!(s.frame_to_timestamp(FrameNumber(1)), 3750);
        assert_eq!(s.frame_to_timestamp(FrameNumber(52)), 195_000);
        assert_eq!(s.timestamp_to_frame(195_000), FrameNumber(52));
        // Nearest-frame rounding on both sides.
        assert_eq!(s.timestamp_to_frame(195_000 + 1874), FrameNumber(52));
        assert_eq!(s.timestamp_to_frame(195_000 + 1875), FrameNumber(53));
    }

    #[test]
    fn mapping_ntsc_rounds_to_nearest_tick() {
        let s = state(Rational::TB_90K, Rational::FPS_29_97, 0);
        // 1001/30000 s = 3003 ticks per frame.
        assert_eq!(s.frame_to_timestamp(FrameNumber(10)), 30_030);
        for f in [0u64, 1, 7, 1000, 123_456] {
            let ts = s.frame_to_timestamp(FrameNumber(f));
            assert_eq!(s.timestamp_to_frame(ts), FrameNumber(f));
        }
    }

    #[test]
    fn mapping_honours_start_offset() {
        let s = state(Rational::new(1, 1000), Rational::FPS_25, 500);
        assert_eq!(s.frame_to_timestamp(FrameNumber(0)), 500);
        assert_eq!(s.frame_to_timestamp(FrameNumber(3)), 620);
        assert_eq!(s.timestamp_to_frame(620), FrameNumber(3));
        assert_eq!(s.timestamp_to_frame(0), FrameNumber(0));
        assert_eq!(s.timestamp_to_frame(-9_000), FrameNumber(0));
    }

    #[test]
    fn large_time_base_does_not_overflow() {
        let s = state(Rational::TB_MICROS, Rational::FPS_60, i64::MAX / 4);
        let f = FrameNumber(10_000_000_000);
        let ts = s.frame_to_timestamp(f);
        assert_eq!(s.timestamp_to_frame(ts), f);
    }

    #[test]
    fn start_timestamp_is_set_once() {
        let mut s = StreamState::new(&info(Rational::TB_90K), Rational::FPS_24, 0);
        assert!(s.establish_start_timestamp(1000));
        assert!(!s.establish_start_timestamp(2000));
        assert_eq!(s.start_timestamp(), Some(1000));
    }

    #[test]
    fn frame_index_follows_timestamp_source() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        let f = frame(Some(3750 * 5), Some(3750 * 3));
        assert_eq!(s.frame_index_of(&f), Some(FrameNumber(5)));
        s.set_timestamp_source(TimestampSource::Dts);
        assert_eq!(s.frame_index_of(&f), Some(FrameNumber(3)));
        s.set_timestamp_source(TimestampSource::FrameCounter);
        assert!(!s.timestamp_is_reliable());
        assert_eq!(s.frame_index_of(&f), None);
        s.note_rewound();
        assert_eq!(s.frame_index_of(&f), Some(FrameNumber(0)));
    }

    #[test]
    fn cursor_lifecycle() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        assert_eq!(s.cursor(), CursorState::Uninitialized);
        assert!(s.needs_seek(FrameNumber(0), 32));

        s.note_seek();
        assert_eq!(s.cursor(), CursorState::Seeking);
        assert_eq!(s.next_frame_expected_out(), None);
        s.note_fed();
        s.note_fed();
        s.note_fed();
        assert_eq!(s.accumulated_latency_frames(), 3);
        s.note_emitted(FrameNumber(48));
        assert_eq!(s.cursor(), CursorState::Sequential);
        assert_eq!(s.accumulated_latency_frames(), 0);
        assert_eq!(s.next_frame_expected_out(), Some(49));
        // Two packets still inside the decoder.
        assert_eq!(s.next_frame_to_feed(), Some(51));

        assert!(!s.needs_seek(FrameNumber(49), 32));
        assert!(!s.needs_seek(FrameNumber(81), 32));
        assert!(s.needs_seek(FrameNumber(82), 32));
        assert!(s.needs_seek(FrameNumber(10), 32));

        s.invalidate();
        assert!(s.needs_seek(FrameNumber(49), 32));
    }

    #[test]
    fn frame_counter_reads_ahead_to_any_forward_target() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        s.set_timestamp_source(TimestampSource::FrameCounter);
        s.note_rewound();
        s.note_fed();
        s.note_emitted(FrameNumber(0));
        assert!(!s.needs_seek(FrameNumber(1), 32));
        assert!(!s.needs_seek(FrameNumber(340), 32));
        assert!(s.needs_seek(FrameNumber(0), 32));
        s.note_stalled();
        assert!(s.needs_seek(FrameNumber(340), 32));
    }

    #[test]
    fn dts_mode_seeks_reorder_depth_earlier() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        assert_eq!(s.dts_lead_ticks(), 0);
        assert_eq!(s.seek_timestamp(FrameNumber(10)), 37_500);
        s.set_timestamp_source(TimestampSource::Dts);
        assert_eq!(s.dts_lead_ticks(), 7_500);
        assert_eq!(s.seek_timestamp(FrameNumber(10)), 30_000);
        assert_eq!(s.seek_timestamp(FrameNumber(0)), -7_500);
    }

    #[test]
    fn stall_predicate_uses_codec_delay_plus_margin() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        s.note_seek();
        for _ in 0..(2 + 4) {
            s.note_fed();
        }
        assert!(!s.is_stalled(4));
        s.note_fed();
        assert!(s.is_stalled(4));
        assert_eq!(s.stall_budget(4), 6);
        s.note_stalled();
        assert!(s.needs_seek(FrameNumber(0), 32));
    }

    #[test]
    fn seek_clears_eof_flag() {
        let mut s = state(Rational::TB_90K, Rational::FPS_24, 0);
        s.note_eof_sent();
        assert!(s.eof_sent());
        s.note_seek();
        assert!(!s.eof_sent());
    }
}
