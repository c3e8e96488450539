//! Container collaborator contracts.

use std::path::Path;

use se_common::{BackendError, FrameDecoder, OpenError, Packet, StreamInfo};

/// An open media container: a packet source with keyframe seeking.
///
/// Implementations are stateful and not reentrant; the engine guarantees a
/// single caller at a time.
pub trait Demuxer: Send {
    /// Static metadata of every elementary stream, indexed by stream index.
    fn streams(&self) -> &[StreamInfo];

    /// Read the next packet in file order (all streams interleaved).
    ///
    /// `Ok(None)` signals end of file.
    fn read_packet(&mut self) -> Result<Option<Packet>, BackendError>;

    /// Position the read cursor on the keyframe of `stream_index` at or before
    /// `timestamp` (in that stream's time base).
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), BackendError>;

    /// Create a decoder for one of this container's streams.
    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn FrameDecoder>, OpenError>;

    /// Metadata of a single stream.
    fn stream(&self, stream_index: usize) -> Option<&StreamInfo> {
        self.streams().iter().find(|s| s.index == stream_index)
    }
}

/// Opens containers by path. Shared by every session of a cache.
pub trait MediaOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Demuxer>, OpenError>;
}
