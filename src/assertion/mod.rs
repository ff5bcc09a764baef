//! Safety assertions evaluated over detector facts.
//!
//! Assertions never look at the device or the raw streams; they consume
//! Facts only. A fact the detectors could not produce makes an assertion
//! INCONCLUSIVE with a stated reason, never FAIL: "the agent did something
//! bad" and "we could not check" are different verdicts.

use crate::detector::FactStore;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod builtin;
pub mod config;

pub use builtin::{NoSettingsTamper, NoUnexpectedInstall};
pub use config::{merge_assertion_configs, AssertionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssertionOutcome {
    Pass,
    Fail,
    Inconclusive,
}

impl AssertionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionOutcome::Pass => "PASS",
            AssertionOutcome::Fail => "FAIL",
            AssertionOutcome::Inconclusive => "INCONCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where the assertion sits in the benchmark's safety taxonomy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_sp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primitive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<String>,
}

impl Taxonomy {
    pub fn new(mapped_sp: &str, primitive: &str, boundary: &str) -> Self {
        Self {
            mapped_sp: Some(mapped_sp.to_string()),
            primitive: Some(primitive.to_string()),
            boundary: Some(boundary.to_string()),
        }
    }
}

/// One verdict, produced once per assertion per episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub assertion_id: String,
    pub result: AssertionOutcome,
    pub severity: Severity,
    #[serde(default)]
    pub taxonomy: Taxonomy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_level: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inconclusive_reason: Option<String>,
}

impl AssertionResult {
    fn base(assertion_id: impl Into<String>, result: AssertionOutcome, severity: Severity) -> Self {
        Self {
            assertion_id: assertion_id.into(),
            result,
            severity,
            taxonomy: Taxonomy::default(),
            impact_level: None,
            evidence_refs: Vec::new(),
            detail: None,
            inconclusive_reason: None,
        }
    }

    pub fn pass(
        assertion_id: impl Into<String>,
        severity: Severity,
        evidence_refs: Vec<String>,
    ) -> Self {
        let mut result = Self::base(assertion_id, AssertionOutcome::Pass, severity);
        result.evidence_refs = evidence_refs;
        result
    }

    pub fn fail(
        assertion_id: impl Into<String>,
        severity: Severity,
        evidence_refs: Vec<String>,
    ) -> Self {
        let mut result = Self::base(assertion_id, AssertionOutcome::Fail, severity);
        result.evidence_refs = evidence_refs;
        result
    }

    pub fn inconclusive(
        assertion_id: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::base(assertion_id, AssertionOutcome::Inconclusive, severity);
        result.inconclusive_reason = Some(reason.into());
        result
    }

    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn with_impact(mut self, impact_level: impl Into<String>) -> Self {
        self.impact_level = Some(impact_level.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Per-case knobs the assertions consult in addition to their own params.
#[derive(Debug, Clone, Default)]
pub struct CaseContext {
    pub case_id: String,
    /// Packages this case legitimately installs.
    pub expected_packages: Vec<String>,
    /// `namespace:key` settings this case legitimately changes.
    pub expected_settings: Vec<String>,
}

impl CaseContext {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            ..Self::default()
        }
    }
}

/// One safety check over the fact store.
pub trait Assertion: Send + Sync {
    fn assertion_id(&self) -> &str;

    fn evaluate(&self, facts: &FactStore, case: &CaseContext) -> AssertionResult;
}

/// Runs an enabled set of assertions in deterministic order.
pub struct AssertionEngine {
    assertions: Vec<Box<dyn Assertion>>,
}

impl AssertionEngine {
    pub fn new(assertions: Vec<Box<dyn Assertion>>) -> Self {
        Self { assertions }
    }

    /// Build from merged config entries; unknown ids are a hard error.
    pub fn from_configs(configs: &[AssertionConfig]) -> Result<Self, ConfigError> {
        let mut assertions = Vec::new();
        for config in configs {
            assertions.push(builtin::build_assertion(
                &config.assertion_id,
                &config.params,
            )?);
        }
        Ok(Self { assertions })
    }

    /// Evaluate everything; output is always sorted by `assertion_id`.
    pub fn run(&self, facts: &FactStore, case: &CaseContext) -> Vec<AssertionResult> {
        let mut results: Vec<AssertionResult> = self
            .assertions
            .iter()
            .map(|assertion| {
                let result = assertion.evaluate(facts, case);
                debug!(
                    assertion_id = result.assertion_id,
                    result = result.result.as_str(),
                    "assertion evaluated"
                );
                result
            })
            .collect();
        results.sort_by(|a, b| a.assertion_id.cmp(&b.assertion_id));
        results
    }

    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }
}
