//! The oracle protocol: pluggable pre/post-check evaluators.
//!
//! An oracle inspects device or host state and renders a decision for one
//! episode. Everything it learns is expressed as [`OracleEvent`] records so
//! that the verdict and the evidence behind it land in the bundle together.
//! Oracles never guess: a missing controller capability or an unprobeable
//! clock produces an inconclusive event, not an error and not a silent pass.

pub mod artifact;
pub mod composite;
pub mod foreground;
pub mod notification;
pub mod registry;
pub mod snapshot;
pub mod ui_token;

pub use composite::AllOfOracle;
pub use registry::OracleRegistry;

use crate::clock::EpisodeTime;
use crate::controller::{CapabilitySet, DeviceController};
use crate::digest::{is_sha256_hex, stable_sha256};
use crate::error::{ConfigError, ContractViolation};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Evidence strength class of an oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleType {
    /// Backed by device/host queries; spoof-resistant.
    Hard,
    /// Derived from UI state; an agent could plausibly fake it.
    Soft,
    /// Mixes both kinds of signal.
    Hybrid,
}

/// When in the episode lifecycle a check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        }
    }
}

/// Where a query went, kept machine-readable for replay and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum QueryLocator {
    Cmd(String),
    Sql(String),
    Path(String),
    Uri(String),
}

/// One query an oracle issued while gathering evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleQuery {
    #[serde(flatten)]
    pub locator: QueryLocator,
    pub timeout_ms: u64,
}

impl OracleQuery {
    pub fn cmd(cmd: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            locator: QueryLocator::Cmd(cmd.into()),
            timeout_ms,
        }
    }

    pub fn path(path: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            locator: QueryLocator::Path(path.into()),
            timeout_ms,
        }
    }

    pub fn uri(uri: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            locator: QueryLocator::Uri(uri.into()),
            timeout_ms,
        }
    }

    pub fn sql(sql: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            locator: QueryLocator::Sql(sql.into()),
            timeout_ms,
        }
    }
}

/// The verdict portion of an oracle event.
///
/// `conclusive` is orthogonal to `success`: "couldn't tell" and "failed" are
/// scientifically different outcomes and are never conflated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleDecision {
    pub success: bool,
    pub score: f64,
    pub reason: String,
    pub conclusive: bool,
}

impl Default for OracleDecision {
    fn default() -> Self {
        Self {
            success: false,
            score: 0.0,
            reason: String::new(),
            conclusive: false,
        }
    }
}

impl OracleDecision {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            score: 1.0,
            reason: reason.into(),
            conclusive: true,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            score: 0.0,
            reason: reason.into(),
            conclusive: true,
        }
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            score: 0.0,
            reason: reason.into(),
            conclusive: false,
        }
    }
}

/// State captured for later diffing rather than judged on the spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// What was captured, e.g. `packages` or `settings`.
    pub kind: String,
    pub data: Value,
    /// True when only an in-line preview exists, with no artifact backing.
    pub preview_only: bool,
    pub artifact_path: Option<String>,
}

impl SnapshotPayload {
    pub fn preview(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            preview_only: true,
            artifact_path: None,
        }
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.preview_only = false;
        self.artifact_path = Some(path.into());
        self
    }

    /// Number of captured items, used to rank competing snapshots.
    pub fn item_count(&self) -> usize {
        match &self.data {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::Null => 0,
            _ => 1,
        }
    }
}

/// Reason string used on snapshot-capture events, which carry state for the
/// detector layer and deliberately decide nothing themselves.
pub const SNAPSHOT_CAPTURE_REASON: &str = "snapshot_capture_only";

/// Default bound on a single device query.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;

pub(crate) fn default_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

/// One record of the OracleEvidence v0 schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleEvent {
    pub oracle_name: String,
    pub oracle_type: OracleType,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<OracleQuery>,
    pub result_digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anti_gaming_notes: Vec<String>,
    pub decision: OracleDecision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities_required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotPayload>,
    pub timestamp_ms: i64,
}

impl OracleEvent {
    pub fn new(
        oracle_name: impl Into<String>,
        oracle_type: OracleType,
        phase: Phase,
        decision: OracleDecision,
    ) -> Self {
        Self {
            oracle_name: oracle_name.into(),
            oracle_type,
            phase,
            queries: Vec::new(),
            result_digest: stable_sha256(&Value::Null),
            anti_gaming_notes: Vec::new(),
            decision,
            capabilities_required: Vec::new(),
            missing_capabilities: Vec::new(),
            snapshot: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// The single event an oracle emits when the controller lacks what it
    /// needs. Never conclusive, never a guess.
    pub fn missing_capability(
        oracle_name: impl Into<String>,
        oracle_type: OracleType,
        phase: Phase,
        required: &CapabilitySet,
        missing: Vec<String>,
    ) -> Self {
        let reason = format!("missing controller capabilities: {}", missing.join(","));
        let mut event = Self::new(
            oracle_name,
            oracle_type,
            phase,
            OracleDecision::inconclusive(reason),
        );
        event.capabilities_required = required.names();
        event.missing_capabilities = missing;
        event
    }

    pub fn with_query(mut self, query: OracleQuery) -> Self {
        self.queries.push(query);
        self
    }

    /// Record the digest of the raw result the decision was based on.
    pub fn with_result(mut self, result: &Value) -> Self {
        self.result_digest = stable_sha256(result);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.anti_gaming_notes.push(note.into());
        self
    }

    pub fn with_capabilities(mut self, required: &CapabilitySet) -> Self {
        self.capabilities_required = required.names();
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotPayload) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Check this event against the v0 schema.
    ///
    /// A malformed event is a bug in the oracle that produced it, so the
    /// writer refuses it outright.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        let fail = |reason: String| ContractViolation::MalformedOracleEvent {
            oracle_name: self.oracle_name.clone(),
            reason,
        };
        if self.oracle_name.trim().is_empty() {
            return Err(fail("oracle_name is empty".to_string()));
        }
        if !self.decision.score.is_finite()
            || !(0.0..=1.0).contains(&self.decision.score)
        {
            return Err(fail(format!(
                "score {} outside [0,1]",
                self.decision.score
            )));
        }
        if !is_sha256_hex(&self.result_digest) {
            return Err(fail(format!(
                "result_digest {:?} is not sha256 hex",
                self.result_digest
            )));
        }
        for query in &self.queries {
            if query.timeout_ms == 0 {
                return Err(fail("query timeout_ms must be positive".to_string()));
            }
        }
        if !self.missing_capabilities.is_empty() && self.decision.conclusive {
            return Err(fail(
                "conclusive decision with missing capabilities".to_string(),
            ));
        }
        if !self.decision.conclusive && self.decision.reason.trim().is_empty() {
            return Err(fail(
                "inconclusive decision without a reason".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordered evidence produced by one oracle invocation.
pub type OracleEvidence = Vec<OracleEvent>;

/// Extract the decision for `(phase, oracle_name)` from an evidence list.
///
/// Scans from the end so the latest matching event wins. Absence of evidence
/// is never success: with no match this returns the all-false default.
pub fn decision_from_evidence(
    evidence: &[OracleEvent],
    phase: Phase,
    oracle_name: &str,
) -> OracleDecision {
    evidence
        .iter()
        .rev()
        .find(|event| event.phase == phase && event.oracle_name == oracle_name)
        .map(|event| event.decision.clone())
        .unwrap_or_default()
}

/// Parse a plugin's params into its typed config struct.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    id: &str,
    params: &Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(params.clone()).map_err(|err| ConfigError::InvalidOracleParams {
        id: id.to_string(),
        reason: err.to_string(),
    })
}

/// Everything an oracle may consult during a check.
pub struct OracleContext<'a> {
    pub controller: &'a dyn DeviceController,
    pub episode_time: &'a EpisodeTime,
    /// The episode bundle, for oracles that read persisted evidence.
    pub bundle_dir: &'a Path,
    /// Host directory for artifact expectations, when the case defines one.
    pub artifacts_root: Option<&'a Path>,
}

/// A pluggable pre/post-check evaluator.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    fn oracle_type(&self) -> OracleType;

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::default()
    }

    /// Runs before the agent acts. Defaults to producing no evidence.
    async fn pre_check(&self, _ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        Ok(Vec::new())
    }

    /// Runs after the episode and renders this oracle's evidence.
    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence>;

    /// Capability gate shared by every oracle: when the controller lacks a
    /// required capability, the whole check collapses to one inconclusive
    /// event.
    fn capability_gate(&self, phase: Phase, ctx: &OracleContext<'_>) -> Option<OracleEvent> {
        let required = self.required_capabilities();
        let missing = ctx
            .controller
            .capabilities()
            .missing_from(&required.to_vec());
        if missing.is_empty() {
            None
        } else {
            Some(OracleEvent::missing_capability(
                self.name(),
                self.oracle_type(),
                phase,
                &required,
                missing.iter().map(|cap| cap.as_str().to_string()).collect(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Capability;

    #[test]
    fn test_decision_from_evidence_defaults_to_all_false() {
        let decision = decision_from_evidence(&[], Phase::Post, "anything");
        assert!(!decision.success);
        assert!(!decision.conclusive);
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn test_decision_from_evidence_takes_latest_match() {
        let evidence = vec![
            OracleEvent::new("a", OracleType::Hard, Phase::Post, OracleDecision::fail("old")),
            OracleEvent::new("b", OracleType::Hard, Phase::Post, OracleDecision::fail("other")),
            OracleEvent::new("a", OracleType::Hard, Phase::Post, OracleDecision::pass("new")),
        ];
        let decision = decision_from_evidence(&evidence, Phase::Post, "a");
        assert!(decision.success);
        assert_eq!(decision.reason, "new");

        // Phase mismatch does not count.
        let decision = decision_from_evidence(&evidence, Phase::Pre, "a");
        assert!(!decision.conclusive);
    }

    #[test]
    fn test_validate_accepts_well_formed_event() {
        let event = OracleEvent::new(
            "fg",
            OracleType::Hard,
            Phase::Post,
            OracleDecision::pass("focused"),
        )
        .with_query(OracleQuery::cmd("dumpsys window", 5_000))
        .with_result(&serde_json::json!({"stdout": "ok"}));
        event.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_score_digest_and_timeout() {
        let mut event = OracleEvent::new(
            "fg",
            OracleType::Hard,
            Phase::Post,
            OracleDecision::pass("ok"),
        );
        event.decision.score = 1.5;
        assert!(event.validate().is_err());

        let mut event = OracleEvent::new(
            "fg",
            OracleType::Hard,
            Phase::Post,
            OracleDecision::pass("ok"),
        );
        event.result_digest = "nope".to_string();
        assert!(event.validate().is_err());

        let event = OracleEvent::new(
            "fg",
            OracleType::Hard,
            Phase::Post,
            OracleDecision::pass("ok"),
        )
        .with_query(OracleQuery::cmd("dumpsys window", 0));
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_validate_forbids_conclusive_with_missing_caps() {
        let required = CapabilitySet::new([Capability::RootShell]);
        let mut event = OracleEvent::missing_capability(
            "fs",
            OracleType::Hard,
            Phase::Post,
            &required,
            vec!["root_shell".to_string()],
        );
        event.validate().unwrap();

        event.decision.conclusive = true;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_validate_requires_reason_on_inconclusive() {
        let event = OracleEvent::new(
            "fg",
            OracleType::Hard,
            Phase::Post,
            OracleDecision::inconclusive(""),
        );
        assert!(event.validate().is_err());
    }
}
