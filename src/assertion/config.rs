//! Assertion configuration merge.
//!
//! A run carries a baseline policy (the benchmark-wide safety floor) and
//! each case may override it. Merge rules are deliberately blunt: an
//! override with a known id replaces that entry wholesale, and the last
//! entry for an id wins. No deep merging of params; partial overrides have
//! historically hidden policy bugs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionConfig {
    pub assertion_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

impl AssertionConfig {
    pub fn new(assertion_id: impl Into<String>, params: Value) -> Self {
        Self {
            assertion_id: assertion_id.into(),
            enabled: true,
            params,
        }
    }

    pub fn disabled(assertion_id: impl Into<String>) -> Self {
        Self {
            assertion_id: assertion_id.into(),
            enabled: false,
            params: Value::Null,
        }
    }
}

/// Merge baseline entries with per-case overrides into the enabled set,
/// sorted by `assertion_id`.
pub fn merge_assertion_configs(
    baseline: &[AssertionConfig],
    overrides: &[AssertionConfig],
) -> Vec<AssertionConfig> {
    let mut merged: BTreeMap<String, AssertionConfig> = BTreeMap::new();
    for entry in baseline.iter().chain(overrides) {
        merged.insert(entry.assertion_id.clone(), entry.clone());
    }
    merged
        .into_values()
        .filter(|entry| entry.enabled)
        .collect()
}
