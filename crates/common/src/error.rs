//! Central error types for the engine (thiserror-based).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::types::FrameNumber;

/// Collaborator operation in which a backend failure surfaced.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Open,
    ReadPacket,
    Seek,
    SendPacket,
    ReceiveFrame,
}

/// Coarse classification of a backend failure, independent of the library's
/// own numeric error codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Malformed or corrupt bitstream / container data.
    InvalidData,
    /// Underlying read or filesystem failure.
    Io,
    /// Feature, codec or operation not supported by the backend.
    Unsupported,
    OutOfMemory,
    Other,
}

/// Error reported by a container or codec collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage:?} failed ({kind:?}, code {code:?}): {message}")]
pub struct BackendError {
    pub stage: Stage,
    pub kind: FailureKind,
    /// Library-specific error code, when one exists.
    pub code: Option<i32>,
    pub message: String,
}

impl BackendError {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

/// Failures opening a container or selecting a stream. Permanent: never
/// retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("Media not found: {path}")]
    NotFound { path: String },

    #[error("Unsupported container {path}: {reason}")]
    UnsupportedContainer { path: String, reason: String },

    #[error("Unsupported codec {codec:?} on stream {stream}")]
    UnsupportedCodec { stream: usize, codec: VideoCodec },

    #[error("No video stream in {path}")]
    NoVideoStream { path: String },

    #[error("Stream {stream} not found or not a video stream")]
    StreamNotFound { stream: usize },

    #[error("Corrupt header: {reason}")]
    CorruptHeader { reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Seek failures. Trigger the single retry-from-keyframe policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeekError {
    #[error("Seek on stream {stream} to timestamp {timestamp} failed: {source}")]
    Failed {
        stream: usize,
        timestamp: i64,
        source: BackendError,
    },

    #[error("Seek for {target} on stream {stream} landed past it at {landed}")]
    Overshoot {
        stream: usize,
        target: FrameNumber,
        landed: FrameNumber,
    },
}

/// Pixel conversion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Unsupported source format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("Plane {plane} missing")]
    PlaneMissing { plane: usize },

    #[error("Plane {plane} too small: need {needed}, got {got}")]
    PlaneTooSmall {
        plane: usize,
        needed: usize,
        got: usize,
    },

    #[error("Output buffer too small: need {needed}, got {got}")]
    OutputTooSmall { needed: usize, got: usize },
}

/// Per-frame decode failures.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("Stream {stream} is not a decodable video stream")]
    UnknownStream { stream: usize },

    #[error(transparent)]
    Seek(#[from] SeekError),

    #[error(
        "Decoder stalled on stream {stream} seeking {frame}: {fed} packets fed without output (budget {budget})"
    )]
    Stalled {
        stream: usize,
        frame: FrameNumber,
        fed: u64,
        budget: u64,
    },

    #[error("End of stream {stream} reached before {frame}")]
    EndOfStream {
        stream: usize,
        frame: FrameNumber,
        last_decoded: Option<FrameNumber>,
    },

    #[error("Read budget of {budget} packets exhausted on stream {stream} seeking {frame}")]
    ReadBudgetExhausted {
        stream: usize,
        frame: FrameNumber,
        budget: u64,
    },

    #[error("Backend failure on stream {stream}: {source}")]
    Backend { stream: usize, source: BackendError },

    #[error("Pixel conversion failed: {0}")]
    Convert(#[from] ConvertError),

    #[error("Decoding {frame} on stream {stream} failed after retry: {source}")]
    RetryExhausted {
        frame: FrameNumber,
        stream: usize,
        source: Box<DecodeError>,
    },
}

impl DecodeError {
    /// Whether the bounded-loop guard tripped, directly or on the retried attempt.
    pub fn is_stall(&self) -> bool {
        match self {
            Self::Stalled { .. } | Self::ReadBudgetExhausted { .. } => true,
            Self::RetryExhausted { source, .. } => source.is_stall(),
            _ => false,
        }
    }

    /// Whether a forced seek-from-keyframe may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Seek(_)
                | Self::Stalled { .. }
                | Self::EndOfStream { .. }
                | Self::ReadBudgetExhausted { .. }
                | Self::Backend { .. }
        )
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = OpenError::NotFound {
            path: "/tmp/missing.mov".into(),
        };
        assert!(err.to_string().contains("missing.mov"));

        let err = DecodeError::Stalled {
            stream: 0,
            frame: FrameNumber(12),
            fed: 19,
            budget: 18,
        };
        let msg = err.to_string();
        assert!(msg.contains("F12") && msg.contains("19") && msg.contains("18"));

        let err = BackendError::new(Stage::SendPacket, FailureKind::InvalidData, "bad slice")
            .with_code(-1094995529);
        assert!(err.to_string().contains("bad slice"));
        assert!(err.to_string().contains("SendPacket"));
    }

    #[test]
    fn stall_detection_through_retry() {
        let inner = DecodeError::Stalled {
            stream: 1,
            frame: FrameNumber(3),
            fed: 10,
            budget: 9,
        };
        assert!(inner.is_retryable());
        let outer = DecodeError::RetryExhausted {
            frame: FrameNumber(3),
            stream: 1,
            source: Box::new(inner),
        };
        assert!(outer.is_stall());
        assert!(!outer.is_retryable());
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!DecodeError::UnknownStream { stream: 4 }.is_retryable());
        let convert: DecodeError = ConvertError::OutputTooSmall { needed: 8, got: 4 }.into();
        assert!(!convert.is_retryable());
        assert!(!convert.is_stall());
    }

    #[test]
    fn json_error_conversion() {
        let result: Result<u32, _> = serde_json::from_str("not json");
        let err: ConfigError = result.unwrap_err().into();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
