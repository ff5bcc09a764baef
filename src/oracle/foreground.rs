//! Hard oracle over the focused window.
//!
//! Asks `dumpsys window` which package owns input focus. Window focus is
//! kernel-side state an agent cannot redraw its way around, which is what
//! makes this check hard evidence.

use super::{
    default_timeout_ms, parse_params, Oracle, OracleContext, OracleDecision, OracleEvent,
    OracleEvidence, OracleQuery, OracleType, Phase,
};
use crate::controller::{Capability, CapabilitySet};
use crate::error::ConfigError;
use crate::evidence::ForegroundInfo;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

const FOCUS_CMD: &str = "dumpsys window windows";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForegroundParams {
    package: String,
    #[serde(default)]
    activity: Option<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

pub struct ForegroundAppOracle {
    name: String,
    expected_package: String,
    expected_activity: Option<String>,
    timeout_ms: u64,
}

impl ForegroundAppOracle {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            name: "foreground_app".to_string(),
            expected_package: package.into(),
            expected_activity: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.expected_activity = Some(activity.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: ForegroundParams = parse_params("foreground_app", params)?;
        let mut oracle = Self::new(params.package).with_timeout(params.timeout_ms);
        if let Some(activity) = params.activity {
            oracle = oracle.with_activity(activity);
        }
        Ok(oracle)
    }

    async fn check(&self, ctx: &OracleContext<'_>, phase: Phase) -> OracleEvent {
        let query = OracleQuery::cmd(FOCUS_CMD, self.timeout_ms);
        let base = |decision: OracleDecision| {
            OracleEvent::new(&self.name, OracleType::Hard, phase, decision)
                .with_query(query.clone())
                .with_capabilities(&self.required_capabilities())
        };

        let out = match ctx.controller.adb_shell(FOCUS_CMD, self.timeout_ms).await {
            Ok(out) => out,
            Err(err) => return base(OracleDecision::inconclusive(err.reason())),
        };
        if !out.ok() {
            return base(OracleDecision::inconclusive(format!(
                "dumpsys window exited with {}",
                out.returncode
            )));
        }

        let Some(focused) = parse_window_focus(&out.stdout) else {
            return base(OracleDecision::inconclusive(
                "could not parse window focus from dumpsys output",
            ));
        };

        let result = json!({
            "stdout": out.stdout,
            "package": focused.package,
            "activity": focused.activity,
        });
        let decision = self.judge(&focused);
        base(decision).with_result(&result)
    }

    fn judge(&self, focused: &ForegroundInfo) -> OracleDecision {
        let package = focused.package.as_deref().unwrap_or("");
        if package != self.expected_package {
            return OracleDecision::fail(format!(
                "foreground package is {package:?}, expected {:?}",
                self.expected_package
            ));
        }
        if let Some(expected) = &self.expected_activity {
            let want = canonical_activity(&self.expected_package, expected);
            let got = focused
                .activity
                .as_deref()
                .map(|a| canonical_activity(&self.expected_package, a));
            if got.as_deref() != Some(want.as_str()) {
                return OracleDecision::fail(format!(
                    "foreground activity is {:?}, expected {want:?}",
                    focused.activity
                ));
            }
        }
        OracleDecision::pass(format!("window focus on {package}"))
    }
}

#[async_trait]
impl Oracle for ForegroundAppOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hard
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new([Capability::AdbShell])
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Post, ctx) {
            return Ok(vec![gate]);
        }
        Ok(vec![self.check(ctx, Phase::Post).await])
    }
}

/// Pull the focused package/activity out of `dumpsys window` output.
///
/// Prefers `mCurrentFocus`, falls back to `mFocusedApp`. Returns `None` when
/// neither parses, which dependent oracles treat as "couldn't tell".
pub(crate) fn parse_window_focus(output: &str) -> Option<ForegroundInfo> {
    let current = Regex::new(r"mCurrentFocus=Window\{\S+\s+\S+\s+([^/\s}]+)(?:/([^\s}]+))?\}")
        .ok()?;
    let focused_app =
        Regex::new(r"mFocusedApp=.*ActivityRecord\{\S+\s+\S+\s+([^/\s}]+)(?:/([^\s}]+))?")
            .ok()?;

    for re in [&current, &focused_app] {
        if let Some(caps) = re.captures(output) {
            let package = caps.get(1)?.as_str().to_string();
            let activity = caps.get(2).map(|m| m.as_str().to_string());
            return Some(ForegroundInfo {
                package: Some(package),
                activity,
            });
        }
    }
    None
}

fn canonical_activity(package: &str, activity: &str) -> String {
    if let Some(rest) = activity.strip_prefix('.') {
        format!("{package}.{rest}")
    } else {
        activity.to_string()
    }
}
