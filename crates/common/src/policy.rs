//! Classification of collaborator failures into "warn and continue" versus
//! "fail the attempt".
//!
//! Backends report failures as [`BackendError`] with a [`Stage`] and a
//! [`FailureKind`]. The decode loop never infers severity from numeric codes;
//! it looks the pair up in an [`ErrorPolicy`] table. Rules are matched in
//! order, first match wins, and anything unmatched is [`Severity::Fatal`].

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, FailureKind, Stage};

/// Outcome of classifying a backend failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Log, count, skip the offending packet and keep decoding.
    Recoverable,
    /// Abort the current decode attempt.
    Fatal,
}

/// One row of the classification table. `None` matches any value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub stage: Option<Stage>,
    pub kind: Option<FailureKind>,
    pub severity: Severity,
}

impl PolicyRule {
    fn matches(&self, stage: Stage, kind: FailureKind) -> bool {
        self.stage.is_none_or(|s| s == stage) && self.kind.is_none_or(|k| k == kind)
    }
}

/// Ordered classification table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    pub rules: Vec<PolicyRule>,
}

impl ErrorPolicy {
    /// A table that treats every failure as fatal.
    pub fn strict() -> Self {
        Self { rules: Vec::new() }
    }

    /// Prepend a rule so it takes precedence over the existing table.
    pub fn with_rule(mut self, stage: Option<Stage>, kind: Option<FailureKind>, severity: Severity) -> Self {
        self.rules.insert(
            0,
            PolicyRule {
                stage,
                kind,
                severity,
            },
        );
        self
    }

    pub fn classify_parts(&self, stage: Stage, kind: FailureKind) -> Severity {
        self.rules
            .iter()
            .find(|r| r.matches(stage, kind))
            .map(|r| r.severity)
            .unwrap_or(Severity::Fatal)
    }

    pub fn classify(&self, err: &BackendError) -> Severity {
        self.classify_parts(err.stage, err.kind)
    }
}

impl Default for ErrorPolicy {
    /// Corrupt packets are skipped while demuxing and decoding; everything
    /// else (I/O, unsupported features, allocation failure, seeks) is fatal.
    fn default() -> Self {
        let recoverable = |stage| PolicyRule {
            stage: Some(stage),
            kind: Some(FailureKind::InvalidData),
            severity: Severity::Recoverable,
        };
        Self {
            rules: vec![
                recoverable(Stage::ReadPacket),
                recoverable(Stage::SendPacket),
                recoverable(Stage::ReceiveFrame),
            ],
        }
    }
}
