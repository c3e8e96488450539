//! `se-demux` — Container collaborator contract.
//!
//! The engine consumes containers through the [`Demuxer`] trait and opens
//! them through a [`MediaOpener`]. No container format is parsed here; real
//! backends wrap a demuxing library, and [`MemoryDemuxer`] serves a packet
//! table held in memory.

pub mod memory;
pub mod traits;

pub use memory::{DecoderFactory, MemoryDemuxer};
pub use traits::{Demuxer, MediaOpener};
