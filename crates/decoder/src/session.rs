//! Decode session: one open container, its video streams and the seek/decode
//! state machine that turns "presentation frame N" into packets and
//! decoder calls.
//!
//! # Algorithm
//!
//! For each request the session decides between reading ahead from the
//! current position and seeking (cursor unknown, target behind the cursor,
//! or target further ahead than `forward_scan_frames`). It then runs a
//! bounded loop:
//!
//! 1. Drain every frame the decoder already holds. Each frame's index comes
//!    from the stream's [`TimestampSource`]. Equal to the target: convert into
//!    the caller's buffer and return. Below: remember it as the closest prior
//!    frame. Above: the seek overshot.
//! 2. Check the stall guard (latency beyond codec delay plus margin) and the
//!    per-attempt read budget.
//! 3. Read one packet. Other streams' packets are skipped; at end of file
//!    the decoder is told so once and drained.
//!
//! A failed attempt that may succeed from a different keyframe is retried
//! exactly once with a forced seek placed a little earlier. Collaborator
//! errors are classified by the configured [`ErrorPolicy`].
//!
//! [`ErrorPolicy`]: se_common::ErrorPolicy

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use se_common::{
    BackendError, DecodeError, DecodedFrame, EngineConfig, FrameDecoder, FrameNumber, OpenError,
    PixelFormat, Rational, SeekError, Severity, StreamInfo, VideoCodec,
};
use se_demux::{Demuxer, MediaOpener};

use crate::convert::PixelConverter;
use crate::stream::{CursorState, StreamState, TimestampSource};

/// Outcome of a successful decode request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The requested frame was written to the output buffer.
    Exact { frame: FrameNumber },
    /// The requested frame was unreachable; `delivered` was written instead.
    Nearest {
        requested: FrameNumber,
        delivered: FrameNumber,
    },
}

impl Delivery {
    /// Frame whose pixels are in the output buffer.
    pub fn frame(&self) -> FrameNumber {
        match *self {
            Self::Exact { frame } => frame,
            Self::Nearest { delivered, .. } => delivered,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact { .. })
    }
}

/// Static description of a video stream, answered without decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSummary {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_aspect_ratio: f64,
    pub frame_count: u64,
    pub frame_rate: Rational,
    pub codec: VideoCodec,
    pub pixel_format: PixelFormat,
    pub timestamp_source: TimestampSource,
    /// Output buffer size the session's converter needs, if it supports the
    /// stream's pixel format.
    pub output_len: Option<usize>,
}

/// Counters accumulated over the lifetime of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub seeks: u64,
    pub packets_read: u64,
    pub packets_fed: u64,
    pub frames_emitted: u64,
    pub frames_delivered: u64,
    pub nearest_substitutions: u64,
    pub retries: u64,
    pub stalls: u64,
    pub recoverable_errors: u64,
}

struct StreamSlot {
    state: StreamState,
    decoder: Box<dyn FrameDecoder>,
    pixel_format: PixelFormat,
}

struct SessionInner {
    demuxer: Box<dyn Demuxer>,
    streams: BTreeMap<usize, StreamSlot>,
    converter: Arc<dyn PixelConverter>,
    config: EngineConfig,
    stats: SessionStats,
    /// Stream the container read position was last moved for.
    active_stream: Option<usize>,
}

/// An open container with per-stream decode state.
///
/// All operations take the session lock for their whole duration, so a
/// session serves one decode at a time while sessions of different files
/// proceed in parallel.
pub struct DecodeSession {
    path: PathBuf,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DecodeSession {
    /// Open `path`, create a decoder per video stream and resolve each
    /// stream's timestamp source, start timestamp and frame count.
    pub fn open(
        path: &Path,
        opener: &dyn MediaOpener,
        converter: Arc<dyn PixelConverter>,
        config: EngineConfig,
    ) -> Result<Self, OpenError> {
        let mut demuxer = opener.open(path)?;
        let infos: Vec<StreamInfo> = demuxer
            .streams()
            .iter()
            .filter(|s| s.is_video())
            .cloned()
            .collect();
        if infos.is_empty() {
            return Err(OpenError::NoVideoStream {
                path: path.display().to_string(),
            });
        }

        let mut streams = BTreeMap::new();
        for info in &infos {
            let frame_rate = resolve_frame_rate(info)?;
            let decoder = demuxer.open_decoder(info.index)?;
            let delay = info.reorder_depth.max(decoder.delay_frames());
            streams.insert(
                info.index,
                StreamSlot {
                    state: StreamState::new(info, frame_rate, delay),
                    decoder,
                    pixel_format: info.pixel_format,
                },
            );
        }

        let tallies = scan_packets(demuxer.as_mut(), &infos, &config)?;
        for info in &infos {
            let (Some(slot), Some(tally)) = (streams.get_mut(&info.index), tallies.get(&info.index))
            else {
                continue;
            };
            resolve_timestamps(&mut slot.state, info, tally);
            let frame_count = derive_frame_count(&slot.state, info, tally, &config);
            slot.state.set_frame_count(frame_count);
            info!(
                path = %path.display(),
                stream = info.index,
                codec = info.codec.display_name(),
                resolution = %info.resolution,
                frame_rate = %slot.state.frame_rate(),
                frames = frame_count,
                timestamps = ?slot.state.timestamp_source(),
                codec_delay = slot.state.codec_delay_frames(),
                "Video stream ready"
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(SessionInner {
                demuxer,
                streams,
                converter,
                config,
                stats: SessionStats::default(),
                active_stream: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Indices of the decodable video streams.
    pub fn streams(&self) -> Vec<usize> {
        self.inner.lock().streams.keys().copied().collect()
    }

    /// Cached metadata of a video stream. Never decodes.
    pub fn info(&self, stream: usize) -> Result<StreamSummary, OpenError> {
        let inner = self.inner.lock();
        let slot = inner
            .streams
            .get(&stream)
            .ok_or(OpenError::StreamNotFound { stream })?;
        let state = &slot.state;
        let resolution = state.resolution();
        Ok(StreamSummary {
            stream_index: stream,
            width: resolution.width,
            height: resolution.height,
            pixel_aspect_ratio: state.pixel_aspect_ratio(),
            frame_count: state.frame_count(),
            frame_rate: state.frame_rate(),
            codec: state.codec(),
            pixel_format: slot.pixel_format,
            timestamp_source: state.timestamp_source(),
            output_len: inner
                .converter
                .output_len_for(resolution, slot.pixel_format)
                .ok(),
        })
    }

    /// Decode presentation frame `frame` of `stream` into `out`.
    ///
    /// With `allow_nearest`, a frame past the end of the stream (or beyond
    /// an unrecoverable overshoot) is substituted by the closest decoded
    /// frame, reported as [`Delivery::Nearest`].
    pub fn decode_frame(
        &self,
        stream: usize,
        frame: FrameNumber,
        allow_nearest: bool,
        out: &mut [u8],
    ) -> Result<Delivery, DecodeError> {
        self.inner.lock().decode(stream, frame, allow_nearest, out)
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.lock().stats.clone()
    }

    pub fn cursor_state(&self, stream: usize) -> Option<CursorState> {
        self.inner
            .lock()
            .streams
            .get(&stream)
            .map(|slot| slot.state.cursor())
    }
}

// ---------------------------------------------------------------------------
// Decode loop
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

impl SessionInner {
    fn decode(
        &mut self,
        stream: usize,
        target: FrameNumber,
        allow_nearest: bool,
        out: &mut [u8],
    ) -> Result<Delivery, DecodeError> {
        let Some(slot) = self.streams.get_mut(&stream) else {
            return Err(DecodeError::UnknownStream { stream });
        };
        if self.active_stream != Some(stream) {
            // The container position was moved for another stream.
            slot.state.invalidate();
            self.active_stream = Some(stream);
        }

        let first = match self.attempt(stream, target, allow_nearest, Attempt::First, out) {
            Ok(delivery) => return Ok(delivery),
            Err(e) => e,
        };
        if !first.is_retryable() {
            self.abandon_cursor(stream);
            return Err(first);
        }

        warn!(stream, frame = %target, error = %first, "Decode attempt failed, retrying from an earlier keyframe");
        self.stats.retries += 1;
        match self.attempt(stream, target, allow_nearest, Attempt::Retry, out) {
            Ok(delivery) => Ok(delivery),
            Err(second) => {
                self.abandon_cursor(stream);
                Err(DecodeError::RetryExhausted {
                    frame: target,
                    stream,
                    source: Box::new(second),
                })
            }
        }
    }

    /// After a failed request the cursor cannot be trusted; a stalled cursor
    /// keeps its state so callers can observe it.
    fn abandon_cursor(&mut self, stream: usize) {
        if let Some(slot) = self.streams.get_mut(&stream) {
            if slot.state.cursor() != CursorState::Stalled {
                slot.state.invalidate();
            }
        }
    }

    fn attempt(
        &mut self,
        stream: usize,
        target: FrameNumber,
        allow_nearest: bool,
        attempt: Attempt,
        out: &mut [u8],
    ) -> Result<Delivery, DecodeError> {
        let Self {
            demuxer,
            streams,
            converter,
            config,
            stats,
            ..
        } = self;
        let slot = streams
            .get_mut(&stream)
            .ok_or(DecodeError::UnknownStream { stream })?;

        if attempt == Attempt::Retry {
            let seek_to = target.saturating_back(config.retry_seek_backoff_frames);
            seek(demuxer.as_mut(), slot, seek_to, stats)?;
        } else if slot.state.needs_seek(target, config.forward_scan_frames) {
            seek(demuxer.as_mut(), slot, target, stats)?;
        }

        let mut closest: Option<(FrameNumber, DecodedFrame)> = None;
        let mut reads: u64 = 0;
        loop {
            while let Some(frame) = receive(slot, config, stats)? {
                stats.frames_emitted += 1;
                let Some(index) = slot.state.frame_index_of(&frame) else {
                    debug!(stream, pts = ?frame.pts, "Dropping frame with unknown position");
                    continue;
                };
                slot.state.note_emitted(index);

                match index.cmp(&target) {
                    Ordering::Equal => {
                        converter.convert(&frame, out)?;
                        stats.frames_delivered += 1;
                        debug!(stream, frame = %index, "Frame delivered");
                        return Ok(Delivery::Exact { frame: index });
                    }
                    Ordering::Less => closest = Some((index, frame)),
                    Ordering::Greater => {
                        let err = SeekError::Overshoot {
                            stream,
                            target,
                            landed: index,
                        };
                        if attempt == Attempt::First || !allow_nearest {
                            return Err(err.into());
                        }
                        let (delivered, frame) = match closest.take() {
                            Some((prior, prior_frame))
                                if target - prior <= index - target =>
                            {
                                (prior, prior_frame)
                            }
                            _ => (index, frame),
                        };
                        return deliver_nearest(converter.as_ref(), stats, &frame, target, delivered, out);
                    }
                }
            }

            if slot.state.is_stalled(config.stall_margin_frames) {
                let fed = slot.state.accumulated_latency_frames();
                let budget = slot.state.stall_budget(config.stall_margin_frames);
                slot.state.note_stalled();
                stats.stalls += 1;
                warn!(stream, frame = %target, fed, budget, "Decoder stalled");
                return Err(DecodeError::Stalled {
                    stream,
                    frame: target,
                    fed,
                    budget,
                });
            }

            if slot.state.eof_sent() {
                // Fully drained; the decoder must be flushed before reuse.
                slot.state.invalidate();
                let last_decoded = closest.as_ref().map(|(index, _)| *index);
                if allow_nearest {
                    if let Some((delivered, frame)) = closest {
                        return deliver_nearest(
                            converter.as_ref(),
                            stats,
                            &frame,
                            target,
                            delivered,
                            out,
                        );
                    }
                }
                return Err(DecodeError::EndOfStream {
                    stream,
                    frame: target,
                    last_decoded,
                });
            }

            if reads >= config.max_packets_per_attempt {
                slot.state.note_stalled();
                stats.stalls += 1;
                warn!(stream, frame = %target, reads, "Read budget exhausted");
                return Err(DecodeError::ReadBudgetExhausted {
                    stream,
                    frame: target,
                    budget: config.max_packets_per_attempt,
                });
            }
            reads += 1;

            let packet = match demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    if let Err(e) = slot.decoder.send_eof() {
                        tolerate(config, stats, stream, e)?;
                    }
                    slot.state.note_eof_sent();
                    debug!(stream, "End of file, draining decoder");
                    continue;
                }
                Err(e) => {
                    tolerate(config, stats, stream, e)?;
                    continue;
                }
            };
            stats.packets_read += 1;
            if packet.stream_index != stream {
                continue;
            }

            if let Err(e) = slot.decoder.send_packet(&packet) {
                tolerate(config, stats, stream, e)?;
            }
            // A rejected packet still counts, so a corrupt run trips the stall guard.
            slot.state.note_fed();
            stats.packets_fed += 1;
        }
    }
}

/// Seek the container for `target` and reset the stream cursor.
///
/// Streams without reliable timestamps rewind to their first packet and
/// count frames from 0.
fn seek(
    demuxer: &mut dyn Demuxer,
    slot: &mut StreamSlot,
    target: FrameNumber,
    stats: &mut SessionStats,
) -> Result<(), DecodeError> {
    let stream = slot.state.stream_index();
    let rewind = !slot.state.timestamp_is_reliable();
    let timestamp = if rewind {
        slot.state.start_timestamp().unwrap_or(0)
    } else {
        slot.state.seek_timestamp(target)
    };

    if let Err(source) = demuxer.seek(stream, timestamp) {
        slot.state.invalidate();
        return Err(SeekError::Failed {
            stream,
            timestamp,
            source,
        }
        .into());
    }
    slot.decoder.flush();
    if rewind {
        slot.state.note_rewound();
    } else {
        slot.state.note_seek();
    }
    stats.seeks += 1;
    debug!(stream, frame = %target, timestamp, rewind, "Seek");
    Ok(())
}

/// Next ready frame, or `None` when the decoder wants input. A recoverable
/// receive failure ends the drain.
fn receive(
    slot: &mut StreamSlot,
    config: &EngineConfig,
    stats: &mut SessionStats,
) -> Result<Option<DecodedFrame>, DecodeError> {
    match slot.decoder.receive_frame() {
        Ok(frame) => Ok(frame),
        Err(e) => {
            tolerate(config, stats, slot.state.stream_index(), e)?;
            Ok(None)
        }
    }
}

/// Log and count a recoverable collaborator failure; fail on a fatal one.
fn tolerate(
    config: &EngineConfig,
    stats: &mut SessionStats,
    stream: usize,
    error: BackendError,
) -> Result<(), DecodeError> {
    match config.error_policy.classify(&error) {
        Severity::Recoverable => {
            stats.recoverable_errors += 1;
            warn!(stream, stage = ?error.stage, kind = ?error.kind, error = %error.message, "Skipping after recoverable error");
            Ok(())
        }
        Severity::Fatal => Err(DecodeError::Backend {
            stream,
            source: error,
        }),
    }
}

fn deliver_nearest(
    converter: &dyn PixelConverter,
    stats: &mut SessionStats,
    frame: &DecodedFrame,
    requested: FrameNumber,
    delivered: FrameNumber,
    out: &mut [u8],
) -> Result<Delivery, DecodeError> {
    converter.convert(frame, out)?;
    stats.frames_delivered += 1;
    stats.nearest_substitutions += 1;
    warn!(requested = %requested, delivered = %delivered, "Delivering nearest frame");
    Ok(Delivery::Nearest {
        requested,
        delivered,
    })
}

// ---------------------------------------------------------------------------
// Open-time probing
// ---------------------------------------------------------------------------

/// What the open-time scan observed for one video stream.
#[derive(Clone, Debug, Default)]
struct ProbeTally {
    probed: u64,
    with_pts: u64,
    with_dts: u64,
    min_pts: Option<i64>,
    min_dts: Option<i64>,
    /// Packets seen over the whole scan.
    packets: u64,
}

impl ProbeTally {
    fn observe(&mut self, pts: Option<i64>, dts: Option<i64>) {
        if let Some(pts) = pts {
            self.with_pts += 1;
            self.min_pts = Some(self.min_pts.map_or(pts, |m| m.min(pts)));
        }
        if let Some(dts) = dts {
            self.with_dts += 1;
            self.min_dts = Some(self.min_dts.map_or(dts, |m| m.min(dts)));
        }
        self.probed += 1;
    }
}

fn resolve_frame_rate(info: &StreamInfo) -> Result<Rational, OpenError> {
    if !info.time_base.is_valid() {
        return Err(OpenError::CorruptHeader {
            reason: format!("stream {} has time base {}", info.index, info.time_base),
        });
    }
    if !info.frame_rate.is_valid() {
        return Err(OpenError::CorruptHeader {
            reason: format!("stream {} declares no frame rate", info.index),
        });
    }
    Ok(info.frame_rate)
}

/// Read the start of the file to probe timestamps. When a stream declares
/// neither frame count nor duration (and counting is enabled) the scan
/// continues to end of file counting packets.
fn scan_packets(
    demuxer: &mut dyn Demuxer,
    infos: &[StreamInfo],
    config: &EngineConfig,
) -> Result<BTreeMap<usize, ProbeTally>, OpenError> {
    let probe = config.probe_packets as u64;
    let counting = config.count_frames_when_unknown
        && infos
            .iter()
            .any(|i| i.frame_count.is_none() && i.duration.is_none());
    // Interleaved streams share the probe window.
    let probe_reads = probe.saturating_mul(demuxer.streams().len().max(1) as u64);

    let mut tallies: BTreeMap<usize, ProbeTally> = infos
        .iter()
        .map(|i| (i.index, ProbeTally::default()))
        .collect();
    let mut reads: u64 = 0;
    let mut consecutive_errors: u64 = 0;

    loop {
        let probing = reads < probe_reads && tallies.values().any(|t| t.probed < probe);
        if !probing && !counting {
            break;
        }
        reads += 1;
        let packet = match demuxer.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => match config.error_policy.classify(&e) {
                Severity::Recoverable if consecutive_errors < probe.max(1) => {
                    consecutive_errors += 1;
                    warn!(error = %e, "Skipping unreadable packet while probing");
                    continue;
                }
                _ => return Err(OpenError::Backend(e)),
            },
        };
        consecutive_errors = 0;

        if let Some(tally) = tallies.get_mut(&packet.stream_index) {
            if tally.probed < probe {
                tally.observe(packet.pts, packet.dts);
            }
            tally.packets += 1;
        }
    }
    debug!(reads, counting, "Open-time packet scan finished");
    Ok(tallies)
}

fn resolve_timestamps(state: &mut StreamState, info: &StreamInfo, tally: &ProbeTally) {
    let all = |n: u64| tally.probed > 0 && n == tally.probed;
    let (source, first) = if all(tally.with_pts) {
        (TimestampSource::Pts, tally.min_pts)
    } else if all(tally.with_dts) {
        (TimestampSource::Dts, tally.min_dts)
    } else {
        (TimestampSource::FrameCounter, None)
    };
    state.set_timestamp_source(source);
    // The first frame out of a reordering decoder carries the DTS of the
    // packet that released it, not the smallest DTS in the file.
    let first = first.map(|ts| ts.saturating_add(state.dts_lead_ticks()));

    if source != TimestampSource::FrameCounter {
        if let Some(start) = info.start_time.or(first) {
            state.establish_start_timestamp(start);
        }
    }
    if source != TimestampSource::Pts {
        warn!(
            stream = info.index,
            source = ?source,
            probed = tally.probed,
            "Presentation timestamps unreliable, using fallback"
        );
    }
}

fn derive_frame_count(
    state: &StreamState,
    info: &StreamInfo,
    tally: &ProbeTally,
    config: &EngineConfig,
) -> u64 {
    if let Some(frames) = info.frame_count {
        return frames;
    }
    if let Some(duration) = info.duration {
        let start = state.start_timestamp().unwrap_or(0);
        return state.timestamp_to_frame(start.saturating_add(duration)).get();
    }
    if config.count_frames_when_unknown {
        return tally.packets;
    }
    0
}
