//! Snapshot oracles: capture device state for later diffing.
//!
//! These run in both phases and decide nothing themselves. Each check emits
//! one event whose snapshot payload carries the captured state; the detector
//! layer re-reads those events from the persisted bundle and computes diffs.
//! A failed probe yields an inconclusive event with no snapshot at all:
//! partial state would make an honest diff impossible.

use super::{
    default_timeout_ms, parse_params, Oracle, OracleContext, OracleDecision, OracleEvent,
    OracleEvidence, OracleQuery, OracleType, Phase, SnapshotPayload, SNAPSHOT_CAPTURE_REASON,
};
use crate::controller::{Capability, CapabilitySet};
use crate::error::ConfigError;
use crate::evidence::best_effort;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

fn default_namespaces() -> Vec<String> {
    vec![
        "system".to_string(),
        "secure".to_string(),
        "global".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsParams {
    #[serde(default = "default_namespaces")]
    namespaces: Vec<String>,
    /// Optional filter of `namespace:key` entries to keep.
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

/// Captures `settings list` output across namespaces, keyed `namespace:key`.
pub struct SettingsSnapshotOracle {
    name: String,
    namespaces: Vec<String>,
    keys: Option<Vec<String>>,
    timeout_ms: u64,
}

impl SettingsSnapshotOracle {
    pub fn new() -> Self {
        Self {
            name: "settings_snapshot".to_string(),
            namespaces: default_namespaces(),
            keys: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: SettingsParams = parse_params("settings_snapshot", params)?;
        let mut oracle = Self::new().with_namespaces(params.namespaces);
        oracle.timeout_ms = params.timeout_ms;
        oracle.keys = params.keys;
        Ok(oracle)
    }

    async fn capture(&self, ctx: &OracleContext<'_>, phase: Phase) -> OracleEvent {
        let mut queries = Vec::new();
        let mut settings: BTreeMap<String, String> = BTreeMap::new();

        for namespace in &self.namespaces {
            let cmd = format!("settings list {namespace}");
            queries.push(OracleQuery::cmd(&cmd, self.timeout_ms));

            let out = match ctx.controller.adb_shell(&cmd, self.timeout_ms).await {
                Ok(out) if out.ok() => out,
                Ok(out) => {
                    return self.degraded(
                        phase,
                        queries,
                        format!(
                            "settings list {namespace} exited with {}",
                            out.returncode
                        ),
                    )
                }
                Err(err) => return self.degraded(phase, queries, err.reason()),
            };

            for line in out.stdout.lines() {
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                settings.insert(format!("{namespace}:{}", key.trim()), value.to_string());
            }
        }

        if let Some(keys) = &self.keys {
            settings.retain(|key, _| keys.iter().any(|wanted| wanted == key));
        }

        let data = match serde_json::to_value(&settings) {
            Ok(data) => data,
            Err(err) => {
                return self.degraded(phase, queries, format!("snapshot encoding failed: {err}"))
            }
        };

        let mut event = OracleEvent::new(
            &self.name,
            OracleType::Hard,
            phase,
            OracleDecision::inconclusive(SNAPSHOT_CAPTURE_REASON),
        )
        .with_result(&data)
        .with_capabilities(&self.required_capabilities())
        .with_snapshot(SnapshotPayload::preview("settings", data.clone()));
        event.queries = queries;
        event
    }

    fn degraded(&self, phase: Phase, queries: Vec<OracleQuery>, reason: String) -> OracleEvent {
        let mut event = OracleEvent::new(
            &self.name,
            OracleType::Hard,
            phase,
            OracleDecision::inconclusive(reason),
        )
        .with_capabilities(&self.required_capabilities());
        event.queries = queries;
        event
    }
}

impl Default for SettingsSnapshotOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for SettingsSnapshotOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hard
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new([Capability::AdbShell])
    }

    async fn pre_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Pre, ctx) {
            return Ok(vec![gate]);
        }
        Ok(vec![self.capture(ctx, Phase::Pre).await])
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Post, ctx) {
            return Ok(vec![gate]);
        }
        Ok(vec![self.capture(ctx, Phase::Post).await])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageParams {
    #[serde(default)]
    third_party_only: bool,
    #[serde(default)]
    persist_artifact: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

/// Captures the installed-package list via `pm list packages`.
pub struct PackageSnapshotOracle {
    name: String,
    third_party_only: bool,
    persist_artifact: bool,
    timeout_ms: u64,
}

impl PackageSnapshotOracle {
    pub fn new() -> Self {
        Self {
            name: "package_snapshot".to_string(),
            third_party_only: false,
            persist_artifact: false,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn third_party_only(mut self) -> Self {
        self.third_party_only = true;
        self
    }

    pub fn persist_artifact(mut self) -> Self {
        self.persist_artifact = true;
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: PackageParams = parse_params("package_snapshot", params)?;
        let mut oracle = Self::new();
        oracle.third_party_only = params.third_party_only;
        oracle.persist_artifact = params.persist_artifact;
        oracle.timeout_ms = params.timeout_ms;
        Ok(oracle)
    }

    async fn capture(&self, ctx: &OracleContext<'_>, phase: Phase) -> OracleEvent {
        let cmd = if self.third_party_only {
            "pm list packages -3"
        } else {
            "pm list packages"
        };
        let query = OracleQuery::cmd(cmd, self.timeout_ms);
        let degraded = |reason: String| {
            OracleEvent::new(
                &self.name,
                OracleType::Hard,
                phase,
                OracleDecision::inconclusive(reason),
            )
            .with_query(query.clone())
            .with_capabilities(&self.required_capabilities())
        };

        let out = match ctx.controller.adb_shell(cmd, self.timeout_ms).await {
            Ok(out) if out.ok() => out,
            Ok(out) => {
                return degraded(format!("pm list packages exited with {}", out.returncode))
            }
            Err(err) => return degraded(err.reason()),
        };

        let mut packages: Vec<String> = out
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect();
        packages.sort_unstable();
        packages.dedup();

        let data = Value::from(packages);
        let mut snapshot = SnapshotPayload::preview("packages", data.clone());
        if self.persist_artifact {
            if let Some(root) = ctx.artifacts_root {
                let file = format!("{}_{}_packages.txt", self.name, phase.as_str());
                let path = root.join(&file);
                if best_effort("persist package snapshot", fs::write(&path, &out.stdout))
                    .is_some()
                {
                    snapshot = snapshot.with_artifact(path.display().to_string());
                }
            }
        }

        OracleEvent::new(
            &self.name,
            OracleType::Hard,
            phase,
            OracleDecision::inconclusive(SNAPSHOT_CAPTURE_REASON),
        )
        .with_query(query)
        .with_result(&data)
        .with_capabilities(&self.required_capabilities())
        .with_snapshot(snapshot)
    }
}

impl Default for PackageSnapshotOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for PackageSnapshotOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hard
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new([Capability::AdbShell])
    }

    async fn pre_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Pre, ctx) {
            return Ok(vec![gate]);
        }
        Ok(vec![self.capture(ctx, Phase::Pre).await])
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Post, ctx) {
            return Ok(vec![gate]);
        }
        Ok(vec![self.capture(ctx, Phase::Post).await])
    }
}
