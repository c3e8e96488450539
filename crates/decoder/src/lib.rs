//! `se-decoder` — Frame-accurate decode/seek engine.
//!
//! Turns "give me presentation frame N of stream S" into the packet reads,
//! seeks and decoder calls needed to produce exactly that frame, and caches
//! open decode contexts per media file.
//!
//! # Architecture
//!
//! The engine sits between a container collaborator ([`se_demux::Demuxer`])
//! and a packet-in/frame-out codec collaborator
//! ([`se_common::FrameDecoder`]). It never parses a container or a
//! bitstream itself.
//!
//! ## Module Overview
//!
//! - [`stream`] — Per-stream state: timestamp ↔ frame mapping, cursor,
//!   latency accounting
//! - [`session`] — `DecodeSession`: the seek/decode state machine with its
//!   stall guard and single retry
//! - [`cache`] — `SessionCache`: one session per canonical path,
//!   single-flight open
//! - [`convert`] — Pixel converters writing into caller buffers
//! - `synthetic` — Deterministic synthetic clips, decoder and opener
//!   (`testing` feature)
//! - `ffmpeg` — FFmpeg backend (`ffmpeg` feature)
//!
//! ## Usage
//!
//! ```ignore
//! use std::path::Path;
//! use std::sync::Arc;
//! use se_common::FrameNumber;
//! use se_decoder::cache::SessionCache;
//! use se_decoder::ffmpeg::FfmpegOpener;
//!
//! let cache = SessionCache::new(Arc::new(FfmpegOpener::new()));
//! let path = Path::new("clip.mov");
//! let info = cache.info(path, 0)?;
//! let mut rgba = vec![0u8; info.output_len.unwrap_or(0)];
//! let delivery = cache.decode_frame(path, 0, FrameNumber(120), true, &mut rgba)?;
//! ```

pub mod cache;
pub mod convert;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod session;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod synthetic;

pub use cache::SessionCache;
pub use convert::{PackedCopy, PixelConverter, YuvToRgba};
pub use session::{DecodeSession, Delivery, SessionStats, StreamSummary};
pub use stream::{CursorState, StreamState, TimestampSource};
