//! Engine configuration: decode-loop budgets, seek heuristics and the
//! collaborator error policy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::ErrorPolicy;

/// Tunables of the decode/seek engine.
///
/// Every field has a default, so a configuration file only needs to name the
/// values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest forward gap (in frames) served by reading ahead instead of seeking.
    pub forward_scan_frames: u64,
    /// Packets fed without output, beyond the codec delay, before a stall is declared.
    pub stall_margin_frames: u64,
    /// Packets inspected at open to choose the timestamp source.
    pub probe_packets: usize,
    /// Hard cap on packets read by a single decode attempt.
    pub max_packets_per_attempt: u64,
    /// How far before the target the retry attempt places its seek.
    pub retry_seek_backoff_frames: u64,
    /// Count packets at open when the container declares neither a frame count nor a duration.
    pub count_frames_when_unknown: bool,
    /// Classification of collaborator failures.
    pub error_policy: ErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            forward_scan_frames: 32,
            stall_margin_frames: 16,
            probe_packets: 64,
            max_packets_per_attempt: 100_000,
            retry_seek_backoff_frames: 12,
            count_frames_when_unknown: true,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, Stage};
    use crate::policy::Severity;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json(r#"{ "forward_scan_frames": 8 }"#).unwrap();
        assert_eq!(cfg.forward_scan_frames, 8);
        assert_eq!(cfg.stall_margin_frames, 16);
        assert_eq!(cfg.error_policy, ErrorPolicy::default());
    }

    #[test]
    fn json_roundtrip_preserves_policy() {
        let cfg = EngineConfig {
            error_policy: ErrorPolicy::strict(),
            ..Default::default()
        };
        let back = EngineConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(
            back.error_policy
                .classify_parts(Stage::SendPacket, FailureKind::InvalidData),
            Severity::Fatal
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "stall_margin_frames": 4, "count_frames_when_unknown": false }}"#
        )
        .unwrap();
        let cfg = EngineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.stall_margin_frames, 4);
        assert!(!cfg.count_frames_when_unknown);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/engine.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
