//! Hybrid oracle over posted notifications.
//!
//! Reads `dumpsys notification --noredact` and looks for a notification
//! matching the expected text. The query itself is a device query, but the
//! content of a notification is something the agent can influence, so the
//! oracle is typed hybrid. Post times are checked against the device time
//! window: a notification posted before the episode proves nothing.

use super::{
    default_timeout_ms, parse_params, Oracle, OracleContext, OracleDecision, OracleEvent,
    OracleEvidence, OracleQuery, OracleType, Phase,
};
use crate::controller::{Capability, CapabilitySet};
use crate::error::ConfigError;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

const DUMP_CMD: &str = "dumpsys notification --noredact";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NotificationParams {
    contains: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NotificationBlock {
    pub package: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub when_ms: Option<i64>,
}

impl NotificationBlock {
    fn matches(&self, needle: &str, package: Option<&str>) -> bool {
        if let Some(expected) = package {
            if self.package.as_deref() != Some(expected) {
                return false;
            }
        }
        self.title.as_deref().is_some_and(|t| t.contains(needle))
            || self.text.as_deref().is_some_and(|t| t.contains(needle))
    }
}

pub struct NotificationOracle {
    name: String,
    contains: String,
    package: Option<String>,
    timeout_ms: u64,
}

impl NotificationOracle {
    pub fn new(contains: impl Into<String>) -> Self {
        Self {
            name: "notification".to_string(),
            contains: contains.into(),
            package: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn from_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: NotificationParams = parse_params("notification", params)?;
        let mut oracle = Self::new(params.contains);
        oracle.package = params.package;
        oracle.timeout_ms = params.timeout_ms;
        Ok(oracle)
    }

    fn event(&self, decision: OracleDecision) -> OracleEvent {
        OracleEvent::new(&self.name, OracleType::Hybrid, Phase::Post, decision)
            .with_query(OracleQuery::cmd(DUMP_CMD, self.timeout_ms))
            .with_capabilities(&self.required_capabilities())
    }
}

#[async_trait]
impl Oracle for NotificationOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hybrid
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new([Capability::AdbShell])
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Post, ctx) {
            return Ok(vec![gate]);
        }

        let Some(window) = ctx.episode_time.device_window(ctx.controller).await else {
            return Ok(vec![self.event(OracleDecision::inconclusive(
                "no episode time anchor for device clock; cannot bound notification age",
            ))]);
        };

        let out = match ctx.controller.adb_shell(DUMP_CMD, self.timeout_ms).await {
            Ok(out) if out.ok() => out,
            Ok(out) => {
                return Ok(vec![self.event(OracleDecision::inconclusive(format!(
                    "dumpsys notification exited with {}",
                    out.returncode
                )))])
            }
            Err(err) => {
                return Ok(vec![self.event(OracleDecision::inconclusive(err.reason()))])
            }
        };

        let blocks = parse_notifications(&out.stdout);
        let matches: Vec<&NotificationBlock> = blocks
            .iter()
            .filter(|block| block.matches(&self.contains, self.package.as_deref()))
            .collect();

        let result = json!({
            "notifications_seen": blocks.len(),
            "matches": matches.len(),
        });

        let event = if matches.is_empty() {
            self.event(OracleDecision::fail(format!(
                "no notification containing {:?} among {} records",
                self.contains,
                blocks.len()
            )))
        } else if let Some(fresh) = matches
            .iter()
            .find(|block| block.when_ms.is_some_and(|ms| window.contains(ms)))
        {
            self.event(OracleDecision::pass(format!(
                "notification from {} posted inside episode window",
                fresh.package.as_deref().unwrap_or("<unknown>")
            )))
        } else if matches.iter().all(|block| block.when_ms.is_some()) {
            self.event(OracleDecision::fail(
                "matching notification posted outside episode window",
            ))
            .with_note("stale notification rejected by anti-gaming window")
        } else {
            self.event(OracleDecision::inconclusive(
                "matching notification found but its post time could not be parsed",
            ))
        };

        Ok(vec![event.with_result(&result)])
    }
}

/// Split dumpsys output into per-notification blocks.
pub(crate) fn parse_notifications(output: &str) -> Vec<NotificationBlock> {
    let Some((pkg_re, title_re, text_re, when_re)) = regexes() else {
        return Vec::new();
    };

    output
        .split("NotificationRecord")
        .skip(1)
        .map(|block| NotificationBlock {
            package: pkg_re
                .captures(block)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            title: title_re
                .captures(block)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            text: text_re
                .captures(block)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            when_ms: when_re
                .captures(block)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<i64>().ok()),
        })
        .collect()
}

fn regexes() -> Option<(Regex, Regex, Regex, Regex)> {
    Some((
        Regex::new(r"pkg=([\w.]+)").ok()?,
        Regex::new(r"android\.title=(?:String\s*)?\(([^)]*)\)").ok()?,
        Regex::new(r"android\.text=(?:String\s*)?\(([^)]*)\)").ok()?,
        Regex::new(r"(?:mCreationTimeMs|mPostTime|postTime)=(\d+)").ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EpisodeTime;
    use crate::controller::testing::{sh, ScriptedController};
    use std::path::Path;

    fn dump(when_ms: i64) -> String {
        format!(
            "Notification List:\n\
             NotificationRecord(0x1: pkg=com.whatsapp user=UserHandle{{0}} id=1)\n\
             \tandroid.title=String (New message)\n\
             \tandroid.text=String (Hello from Bob)\n\
             \tmCreationTimeMs={when_ms}\n\
             NotificationRecord(0x2: pkg=com.android.systemui user=UserHandle{{0}} id=2)\n\
             \tandroid.title=String (Battery)\n\
             \tandroid.text=String (Charging)\n\
             \tmCreationTimeMs={when_ms}\n"
        )
    }

    fn ctx<'a>(
        controller: &'a ScriptedController,
        time: &'a EpisodeTime,
    ) -> OracleContext<'a> {
        OracleContext {
            controller,
            episode_time: time,
            bundle_dir: Path::new("/tmp"),
            artifacts_root: None,
        }
    }

    #[test]
    fn test_parse_notifications_extracts_fields() {
        let blocks = parse_notifications(&dump(1_000_500));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].package.as_deref(), Some("com.whatsapp"));
        assert_eq!(blocks[0].title.as_deref(), Some("New message"));
        assert_eq!(blocks[0].text.as_deref(), Some("Hello from Bob"));
        assert_eq!(blocks[0].when_ms, Some(1_000_500));
    }

    #[tokio::test]
    async fn test_fresh_matching_notification_passes() {
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("dumpsys notification", sh(&dump(1_000_500)));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = NotificationOracle::new("Hello from Bob").from_package("com.whatsapp");

        let evidence = oracle.post_check(&ctx(&controller, &time)).await.unwrap();
        let event = &evidence[0];
        event.validate().unwrap();
        assert!(event.decision.success, "{:?}", event.decision);
        assert_eq!(event.oracle_type, OracleType::Hybrid);
    }

    #[tokio::test]
    async fn test_stale_notification_fails_with_note() {
        // Posted long before the device anchor.
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("dumpsys notification", sh(&dump(100_000)));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = NotificationOracle::new("Hello from Bob");

        let evidence = oracle.post_check(&ctx(&controller, &time)).await.unwrap();
        let event = &evidence[0];
        assert!(!event.decision.success);
        assert!(event.decision.conclusive);
        assert!(event
            .anti_gaming_notes
            .iter()
            .any(|n| n.contains("stale notification")));
    }

    #[tokio::test]
    async fn test_no_match_fails() {
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("dumpsys notification", sh(&dump(1_000_500)));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = NotificationOracle::new("Transfer complete");

        let evidence = oracle.post_check(&ctx(&controller, &time)).await.unwrap();
        assert!(!evidence[0].decision.success);
        assert!(evidence[0].decision.conclusive);
    }

    #[tokio::test]
    async fn test_missing_anchor_is_inconclusive() {
        let controller = ScriptedController::shell_only()
            .on("dumpsys notification", sh(&dump(1_000_500)));
        let time = EpisodeTime::fixed(0, None, 120_000);
        let oracle = NotificationOracle::new("Hello from Bob");

        let evidence = oracle.post_check(&ctx(&controller, &time)).await.unwrap();
        let decision = &evidence[0].decision;
        assert!(!decision.conclusive);
        assert!(decision.reason.contains("episode time anchor"));
    }

    #[tokio::test]
    async fn test_package_filter_excludes_other_apps() {
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("dumpsys notification", sh(&dump(1_000_500)));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = NotificationOracle::new("Charging").from_package("com.whatsapp");

        let evidence = oracle.post_check(&ctx(&controller, &time)).await.unwrap();
        assert!(!evidence[0].decision.success);
    }
}
