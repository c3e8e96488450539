//! `se-common` — Shared types, traits, and errors for the decode/seek engine.
//!
//! This crate is the foundation that all other engine crates depend on.
//! It defines the core abstractions:
//!
//! - **Types**: `FrameNumber`, `Rational`, `Resolution` (newtypes for safety)
//! - **Packets**: `Packet`, `DecodedFrame`, `StreamInfo` (data flow types)
//! - **Decoder trait**: `FrameDecoder` (codec collaborator contract)
//! - **Errors**: `OpenError`, `SeekError`, `DecodeError`, `BackendError` (thiserror-based)
//! - **Policy**: `ErrorPolicy` (warn-and-continue vs fail classification table)
//! - **Config**: `EngineConfig`

pub mod codec;
pub mod color;
pub mod config;
pub mod decode_traits;
pub mod error;
pub mod packet;
pub mod policy;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{MediaKind, VideoCodec};
pub use color::PixelFormat;
pub use config::EngineConfig;
pub use decode_traits::FrameDecoder;
pub use error::{
    BackendError, ConfigError, ConvertError, DecodeError, FailureKind, OpenError, SeekError,
    Stage,
};
pub use packet::{DecodedFrame, Packet, Plane, StreamInfo};
pub use policy::{ErrorPolicy, PolicyRule, Severity};
pub use types::{FrameNumber, Rational, Resolution};
