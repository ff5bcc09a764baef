//! Error taxonomy for the verification engine.
//!
//! Three failure classes, kept strictly apart:
//! - [`ContractViolation`]: a bug in evidence production. Raised immediately,
//!   never recovered, because recovering would corrupt the trust model.
//! - Capability/infra gaps: not errors at all. They surface as
//!   `conclusive=false` oracle decisions with a machine-readable reason.
//! - [`EvidenceError`]: I/O and serialization failures while persisting a
//!   bundle. These abort the current operation but are ordinary errors.

use thiserror::Error;

/// A hard invariant of the evidence schema was broken by the producer.
///
/// Every variant indicates a programming error upstream, not a property of
/// the device under test. Callers must propagate these, never swallow them.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("step_idx must strictly increase: got {got} after watermark {last}")]
    NonMonotonicStepIdx { got: u64, last: u64 },

    #[error("L0 event at step {step_idx} must bind ref_step_idx to itself, got {ref_step_idx:?}")]
    L0RefMismatch {
        step_idx: u64,
        ref_step_idx: Option<u64>,
    },

    #[error("L0 event at step {step_idx} carries mapping warnings {warnings:?}; ground-truth events may not hedge")]
    L0WithWarnings {
        step_idx: u64,
        warnings: Vec<String>,
    },

    #[error("L0 event at step {step_idx} has unresolved coordinates; harness-executed inputs are always resolved")]
    L0Unresolved { step_idx: u64 },

    #[error("event at step {step_idx} has unresolved coordinates but no coord_unresolved warning")]
    UnresolvedWithoutWarning { step_idx: u64 },

    #[error("event at step {step_idx} has resolved coordinates but claims coord_unresolved")]
    ResolvedWithWarning { step_idx: u64 },

    #[error("coord_space for step {step_idx} must be \"physical_px\", got {got:?}")]
    BadCoordSpace { step_idx: u64, got: String },

    #[error("malformed oracle event from {oracle_name:?}: {reason}")]
    MalformedOracleEvent { oracle_name: String, reason: String },

    #[error("evidence writer for episode {episode_id} is closed")]
    WriterClosed { episode_id: String },
}

/// Configuration rejected at load time. Fail fast rather than silently no-op.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown oracle plugin id {id:?}")]
    UnknownPluginId { id: String },

    #[error("duplicate oracle plugin id {id:?}")]
    DuplicatePluginId { id: String },

    #[error("oracle config is missing a \"type\"/\"plugin\" key: {config}")]
    MissingPluginKey { config: String },

    #[error("invalid params for oracle {id:?}: {reason}")]
    InvalidOracleParams { id: String, reason: String },

    #[error("unknown assertion id {id:?}")]
    UnknownAssertionId { id: String },

    #[error("invalid params for assertion {id:?}: {reason}")]
    InvalidAssertionParams { id: String, reason: String },
}

/// Failure while persisting or reading back an evidence bundle.
#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("evidence bundle I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("evidence serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}
