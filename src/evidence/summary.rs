//! Episode summary derivation.
//!
//! `summary.json` is the one file downstream reporting reads without opening
//! the streams, so everything in it is derived deterministically from what
//! the writer retained plus the caller-supplied governance inputs.

use crate::assertion::{AssertionOutcome, AssertionResult};
use crate::oracle::{OracleEvent, OracleType, Phase};
use crate::trace::{TraceAudit, TraceLevel};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Overall episode verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Success,
    Fail,
    Inconclusive,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Success => "success",
            EpisodeStatus::Fail => "fail",
            EpisodeStatus::Inconclusive => "inconclusive",
        }
    }
}

/// What the oracle layer concluded, separated from the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleDecisionLabel {
    Pass,
    Fail,
    Inconclusive,
    NotApplicable,
}

impl OracleDecisionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleDecisionLabel::Pass => "pass",
            OracleDecisionLabel::Fail => "fail",
            OracleDecisionLabel::Inconclusive => "inconclusive",
            OracleDecisionLabel::NotApplicable => "not_applicable",
        }
    }
}

/// How spoof-resistant the evidence behind the verdict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTrustLevel {
    /// At least one conclusive decision came from a hard or hybrid oracle.
    VerifiedHard,
    /// Only UI-derived evidence backs the verdict.
    SoftOnly,
    /// The device-input trace failed re-validation.
    Degraded,
}

/// Caller-supplied context the writer cannot derive on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryInputs<'a> {
    /// Task-success claim from the run layer, in any of its historical
    /// shapes: a bare bool, the string `"unknown"`, or `{"success": bool}`.
    pub task_success: Option<&'a Value>,
    /// Overrides the writer's own finish-action detection when set.
    pub agent_reported_finished: Option<bool>,
    pub failure_class: Option<&'a str>,
    pub trace_audit: Option<&'a TraceAudit>,
}

/// The finalized verdict record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub episode_id: String,
    pub status: EpisodeStatus,
    pub oracle_decision: OracleDecisionLabel,
    pub task_success: Value,
    pub agent_reported_finished: bool,
    pub failure_class: Option<String>,
    pub action_trace_level: TraceLevel,
    pub trace_degraded_reason: Option<String>,
    pub evidence_trust_level: EvidenceTrustLevel,
    pub oracle_events_total: usize,
    pub assertions_pass: usize,
    pub assertions_fail: usize,
    pub assertions_inconclusive: usize,
    pub created_at_ms: i64,
}

pub(super) fn derive(
    episode_id: &str,
    inputs: SummaryInputs<'_>,
    oracle_events: &[OracleEvent],
    assertion_results: &[AssertionResult],
    agent_reported_finished: bool,
) -> Summary {
    let oracle_decision = derive_oracle_decision(oracle_events);
    let task_success = normalize_task_success(inputs.task_success);

    let mut pass = 0usize;
    let mut fail = 0usize;
    let mut inconclusive = 0usize;
    for result in assertion_results {
        match result.result {
            AssertionOutcome::Pass => pass += 1,
            AssertionOutcome::Fail => fail += 1,
            AssertionOutcome::Inconclusive => inconclusive += 1,
        }
    }

    let status = if fail > 0 {
        EpisodeStatus::Fail
    } else {
        match oracle_decision {
            OracleDecisionLabel::Pass => EpisodeStatus::Success,
            OracleDecisionLabel::Fail => EpisodeStatus::Fail,
            OracleDecisionLabel::Inconclusive => EpisodeStatus::Inconclusive,
            OracleDecisionLabel::NotApplicable => match &task_success {
                Value::Bool(true) => EpisodeStatus::Success,
                Value::Bool(false) => EpisodeStatus::Fail,
                _ => EpisodeStatus::Inconclusive,
            },
        }
    };

    let failure_class = match (inputs.failure_class, status) {
        (Some(class), _) => Some(class.to_string()),
        (None, EpisodeStatus::Fail) if fail > 0 => Some("assertion_failure".to_string()),
        (None, EpisodeStatus::Fail) => Some("oracle_negative".to_string()),
        _ => None,
    };

    let (action_trace_level, trace_degraded_reason) = match inputs.trace_audit {
        Some(audit) => (audit.level, audit.degraded_reason.clone()),
        None => (TraceLevel::None, None),
    };

    let evidence_trust_level = if inputs.trace_audit.is_some_and(|a| a.is_degraded()) {
        EvidenceTrustLevel::Degraded
    } else if oracle_events.iter().any(|event| {
        matches!(event.oracle_type, OracleType::Hard | OracleType::Hybrid)
            && event.decision.conclusive
    }) {
        EvidenceTrustLevel::VerifiedHard
    } else {
        EvidenceTrustLevel::SoftOnly
    };

    Summary {
        episode_id: episode_id.to_string(),
        status,
        oracle_decision,
        task_success,
        agent_reported_finished,
        failure_class,
        action_trace_level,
        trace_degraded_reason,
        evidence_trust_level,
        oracle_events_total: oracle_events.len(),
        assertions_pass: pass,
        assertions_fail: fail,
        assertions_inconclusive: inconclusive,
        created_at_ms: Utc::now().timestamp_millis(),
    }
}

/// Latest conclusive post-phase decision wins; post events without any
/// conclusive decision are inconclusive; no post events at all means the
/// oracles simply were not asked.
fn derive_oracle_decision(events: &[OracleEvent]) -> OracleDecisionLabel {
    let mut saw_post = false;
    for event in events.iter().rev() {
        if event.phase != Phase::Post {
            continue;
        }
        saw_post = true;
        if event.decision.conclusive {
            return if event.decision.success {
                OracleDecisionLabel::Pass
            } else {
                OracleDecisionLabel::Fail
            };
        }
    }
    if saw_post {
        OracleDecisionLabel::Inconclusive
    } else {
        OracleDecisionLabel::NotApplicable
    }
}

fn normalize_task_success(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::Bool(b)) => Value::Bool(*b),
        Some(Value::Object(map)) => match map.get("success") {
            Some(Value::Bool(b)) => Value::Bool(*b),
            _ => Value::String("unknown".to_string()),
        },
        _ => Value::String("unknown".to_string()),
    }
}
