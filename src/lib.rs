//! Oracle and evidence verification engine for Android-agent benchmarks.
//!
//! Turns an untrusted stream of device observations and agent actions into
//! a defensible verdict:
//! - Append-only evidence bundles with content-addressed digests
//! - A strict device-input trace contract (L0/L1/L2 provenance tiers)
//! - Pluggable pre/post oracles bounded by anti-gaming time windows
//! - A detector pass that distills persisted evidence into Facts
//! - Safety assertions merged from policy and per-case config

pub mod action;
pub mod assertion;
pub mod clock;
pub mod controller;
pub mod detector;
pub mod digest;
pub mod error;
pub mod evidence;
pub mod harness;
pub mod oracle;
pub mod telemetry;
pub mod trace;

// Re-exports for convenience
pub use assertion::{AssertionEngine, AssertionResult, CaseContext};
pub use clock::{EpisodeTime, TimeWindow};
pub use controller::{Capability, CapabilitySet, DeviceController, ShellOutput};
pub use detector::{BundleReader, DetectorSet, Fact, FactStore};
pub use error::{ConfigError, ContractViolation, EvidenceError};
pub use evidence::{EvidenceWriter, Summary, SummaryInputs, WriterConfig};
pub use harness::EpisodeEvaluator;
pub use oracle::{
    decision_from_evidence, Oracle, OracleContext, OracleDecision, OracleEvent, OracleRegistry,
    Phase,
};
pub use trace::{DeviceInputEvent, SourceLevel, TraceAudit};
