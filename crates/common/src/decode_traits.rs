//! Codec collaborator abstraction.
//!
//! The engine never decodes a bitstream itself. Every backend (FFmpeg, the
//! synthetic test codec) implements [`FrameDecoder`] and the decode loop
//! programs against the trait only.

use crate::error::BackendError;
use crate::packet::{DecodedFrame, Packet};

/// Packet-in, frame-out video decoder with an internal reorder buffer.
///
/// The contract mirrors the send/receive model of modern codec libraries:
/// a packet fed by [`send_packet`](Self::send_packet) may produce zero or more
/// frames, possibly much later, retrieved one at a time with
/// [`receive_frame`](Self::receive_frame).
pub trait FrameDecoder: Send {
    /// Feed one compressed packet.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError>;

    /// Signal end of input so buffered frames are released.
    fn send_eof(&mut self) -> Result<(), BackendError>;

    /// Retrieve the next decoded frame in presentation order.
    ///
    /// `Ok(None)` means the decoder needs more input, or has been fully
    /// drained after [`send_eof`](Self::send_eof).
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, BackendError>;

    /// Discard all buffered state; called after every container seek.
    fn flush(&mut self);

    /// Frames this decoder buffers before its first output (reorder depth
    /// plus any pipeline delay).
    fn delay_frames(&self) -> u32;
}
