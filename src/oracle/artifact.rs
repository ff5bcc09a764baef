//! Hard oracle over an expected file artifact.
//!
//! Verifies that a file the task should have produced actually exists, has
//! plausible size, and was created during this episode. The time-window
//! check is what stops a stale pre-existing file from forging a pass;
//! `pre_check` additionally moves any pre-existing host artifact aside so
//! the post phase can only see files the episode itself produced.

use super::{
    default_timeout_ms, parse_params, Oracle, OracleContext, OracleDecision, OracleEvent,
    OracleEvidence, OracleQuery, OracleType, Phase,
};
use crate::clock::TimeWindow;
use crate::controller::{Capability, CapabilitySet};
use crate::digest::stable_file_sha256;
use crate::error::ConfigError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactParams {
    path: String,
    #[serde(default)]
    on_device: bool,
    #[serde(default)]
    min_size_bytes: Option<u64>,
    #[serde(default = "default_true")]
    clear_before: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

pub struct FileArtifactOracle {
    name: String,
    path: String,
    on_device: bool,
    min_size_bytes: Option<u64>,
    clear_before: bool,
    timeout_ms: u64,
}

impl FileArtifactOracle {
    pub fn host(path: impl Into<String>) -> Self {
        Self {
            name: "file_artifact".to_string(),
            path: path.into(),
            on_device: false,
            min_size_bytes: None,
            clear_before: true,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn on_device(path: impl Into<String>) -> Self {
        let mut oracle = Self::host(path);
        oracle.on_device = true;
        oracle
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn min_size(mut self, bytes: u64) -> Self {
        self.min_size_bytes = Some(bytes);
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: ArtifactParams = parse_params("file_artifact", params)?;
        let mut oracle = if params.on_device {
            Self::on_device(params.path)
        } else {
            Self::host(params.path)
        };
        oracle.min_size_bytes = params.min_size_bytes;
        oracle.clear_before = params.clear_before;
        oracle.timeout_ms = params.timeout_ms;
        Ok(oracle)
    }

    /// Relative host paths resolve against the run's artifacts root.
    fn host_path(&self, ctx: &OracleContext<'_>) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_relative() {
            if let Some(root) = ctx.artifacts_root {
                return root.join(path);
            }
        }
        path.to_path_buf()
    }

    fn event(&self, phase: Phase, decision: OracleDecision) -> OracleEvent {
        OracleEvent::new(&self.name, OracleType::Hard, phase, decision)
            .with_query(OracleQuery::path(&self.path, self.timeout_ms))
            .with_capabilities(&self.required_capabilities())
    }

    fn check_size(&self, size: u64) -> Option<OracleDecision> {
        match self.min_size_bytes {
            Some(min) if size < min => Some(OracleDecision::fail(format!(
                "artifact is {size} bytes, below required {min}"
            ))),
            _ => None,
        }
    }

    fn judge_mtime(&self, mtime_ms: i64, window: &TimeWindow) -> Result<(), OracleEvent> {
        if window.contains(mtime_ms) {
            Ok(())
        } else {
            Err(self
                .event(
                    Phase::Post,
                    OracleDecision::fail(format!(
                        "artifact mtime {mtime_ms} outside episode window [{}, {}]",
                        window.start_ms, window.end_ms
                    )),
                )
                .with_note("stale artifact rejected by anti-gaming window"))
        }
    }

    fn host_post(&self, ctx: &OracleContext<'_>) -> OracleEvent {
        let path = self.host_path(ctx);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => {
                return self.event(
                    Phase::Post,
                    OracleDecision::fail(format!("artifact not found at {}", path.display())),
                )
            }
        };

        if let Some(decision) = self.check_size(metadata.len()) {
            return self.event(Phase::Post, decision);
        }

        let mtime_ms = match metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        {
            Some(age) => age.as_millis() as i64,
            None => {
                return self.event(
                    Phase::Post,
                    OracleDecision::inconclusive("artifact mtime unavailable on this filesystem"),
                )
            }
        };

        if let Err(stale) = self.judge_mtime(mtime_ms, &ctx.episode_time.host_window()) {
            return stale;
        }

        let sha256 = match stable_file_sha256(&path) {
            Ok(digest) => digest,
            Err(err) => {
                return self.event(
                    Phase::Post,
                    OracleDecision::inconclusive(format!("artifact unreadable: {err}")),
                )
            }
        };
        let result = json!({
            "sha256": sha256,
            "size_bytes": metadata.len(),
            "mtime_ms": mtime_ms,
        });
        self.event(
            Phase::Post,
            OracleDecision::pass(format!("artifact present, sha256 {}", &sha256[..12])),
        )
        .with_result(&result)
    }

    async fn device_post(&self, ctx: &OracleContext<'_>) -> OracleEvent {
        let Some(window) = ctx.episode_time.device_window(ctx.controller).await else {
            return self.event(
                Phase::Post,
                OracleDecision::inconclusive(
                    "no episode time anchor for device clock; cannot bound artifact age",
                ),
            );
        };

        let cmd = format!("stat -c %Y:%s {}", self.path);
        let out = match ctx.controller.adb_shell(&cmd, self.timeout_ms).await {
            Ok(out) => out,
            Err(err) => {
                return self.event(Phase::Post, OracleDecision::inconclusive(err.reason()))
            }
        };
        if !out.ok() {
            let text = format!("{}{}", out.stdout, out.stderr);
            if text.contains("No such file") {
                return self.event(
                    Phase::Post,
                    OracleDecision::fail(format!("artifact not found on device at {}", self.path)),
                );
            }
            return self.event(
                Phase::Post,
                OracleDecision::inconclusive(format!("stat exited with {}", out.returncode)),
            );
        }

        let parsed = out.stdout.trim().split_once(':').and_then(|(mtime, size)| {
            Some((mtime.parse::<i64>().ok()?, size.parse::<u64>().ok()?))
        });
        let Some((mtime_s, size)) = parsed else {
            return self.event(
                Phase::Post,
                OracleDecision::inconclusive(format!(
                    "unparseable stat output: {:?}",
                    out.stdout.trim()
                )),
            );
        };

        if let Some(decision) = self.check_size(size) {
            return self.event(Phase::Post, decision);
        }
        let mtime_ms = mtime_s * 1_000;
        if let Err(stale) = self.judge_mtime(mtime_ms, &window) {
            return stale;
        }

        let result = json!({ "size_bytes": size, "mtime_ms": mtime_ms });
        self.event(
            Phase::Post,
            OracleDecision::pass(format!("device artifact present at {}", self.path)),
        )
        .with_result(&result)
    }

    /// Move a pre-existing host artifact aside so it cannot forge a pass.
    fn host_pre(&self, ctx: &OracleContext<'_>) -> OracleEvent {
        let path = self.host_path(ctx);
        if !path.exists() {
            return self.event(
                Phase::Pre,
                OracleDecision::inconclusive(format!(
                    "no pre-existing artifact at {}",
                    path.display()
                )),
            );
        }
        if !self.clear_before {
            return self
                .event(
                    Phase::Pre,
                    OracleDecision::inconclusive("pre-existing artifact left in place"),
                )
                .with_note("pre-existing artifact present before episode start");
        }

        let aside = path.with_extension(format!(
            "pre_existing.{}",
            ctx.episode_time.host_t0_ms()
        ));
        match fs::rename(&path, &aside) {
            Ok(()) => self
                .event(
                    Phase::Pre,
                    OracleDecision::inconclusive("pre-run artifact cleanup"),
                )
                .with_note(format!(
                    "pre-existing artifact moved aside to {}",
                    aside.display()
                )),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to move stale artifact");
                self.event(
                    Phase::Pre,
                    OracleDecision::inconclusive(format!(
                        "pre-run artifact cleanup failed: {err}"
                    )),
                )
                .with_note("stale artifact may still be present")
            }
        }
    }

    async fn device_pre(&self, ctx: &OracleContext<'_>) -> OracleEvent {
        let cmd = format!("stat -c %Y:%s {}", self.path);
        let note = match ctx.controller.adb_shell(&cmd, self.timeout_ms).await {
            Ok(out) if out.ok() => "pre-existing device artifact present before episode start",
            _ => "no pre-existing device artifact",
        };
        self.event(
            Phase::Pre,
            OracleDecision::inconclusive("pre-run artifact probe"),
        )
        .with_note(note)
    }
}

#[async_trait]
impl Oracle for FileArtifactOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hard
    }

    fn required_capabilities(&self) -> CapabilitySet {
        if self.on_device {
            CapabilitySet::new([Capability::AdbShell])
        } else {
            CapabilitySet::default()
        }
    }

    async fn pre_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Pre, ctx) {
            return Ok(vec![gate]);
        }
        let event = if self.on_device {
            self.device_pre(ctx).await
        } else {
            self.host_pre(ctx)
        };
        Ok(vec![event])
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        if let Some(gate) = self.capability_gate(Phase::Post, ctx) {
            return Ok(vec![gate]);
        }
        let event = if self.on_device {
            self.device_post(ctx).await
        } else {
            self.host_post(ctx)
        };
        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::EpisodeTime;
    use crate::controller::testing::{sh, ScriptedController};
    use crate::controller::ShellOutput;
    use tempfile::tempdir;

    fn ctx<'a>(
        controller: &'a ScriptedController,
        time: &'a EpisodeTime,
        bundle: &'a Path,
        artifacts: Option<&'a Path>,
    ) -> OracleContext<'a> {
        OracleContext {
            controller,
            episode_time: time,
            bundle_dir: bundle,
            artifacts_root: artifacts,
        }
    }

    #[tokio::test]
    async fn test_host_artifact_inside_window_passes() {
        let dir = tempdir().unwrap();
        let time = EpisodeTime::host_only(60_000);
        fs::write(dir.path().join("receipt.pdf"), b"%PDF-1.7 payload").unwrap();

        let controller = ScriptedController::shell_only();
        let oracle = FileArtifactOracle::host("receipt.pdf");
        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), Some(dir.path())))
            .await
            .unwrap();
        let event = &evidence[0];
        event.validate().unwrap();
        assert!(event.decision.success);
        assert!(event.decision.conclusive);
    }

    #[tokio::test]
    async fn test_host_artifact_outside_window_fails_with_note() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("receipt.pdf"), b"stale bytes").unwrap();
        // Anchor far in the future: nothing written now can fall inside.
        let time = EpisodeTime::fixed(i64::MAX / 2, None, 0);

        let controller = ScriptedController::shell_only();
        let oracle = FileArtifactOracle::host("receipt.pdf");
        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), Some(dir.path())))
            .await
            .unwrap();
        let event = &evidence[0];
        assert!(!event.decision.success);
        assert!(event.decision.conclusive);
        assert!(event
            .anti_gaming_notes
            .iter()
            .any(|n| n.contains("anti-gaming window")));
    }

    #[tokio::test]
    async fn test_missing_host_artifact_fails() {
        let dir = tempdir().unwrap();
        let time = EpisodeTime::host_only(60_000);
        let controller = ScriptedController::shell_only();
        let oracle = FileArtifactOracle::host("receipt.pdf");

        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), Some(dir.path())))
            .await
            .unwrap();
        assert!(!evidence[0].decision.success);
        assert!(evidence[0].decision.conclusive);
        assert!(evidence[0].decision.reason.contains("not found"));
    }

    #[tokio::test]
    async fn test_min_size_enforced() {
        let dir = tempdir().unwrap();
        let time = EpisodeTime::host_only(60_000);
        fs::write(dir.path().join("receipt.pdf"), b"x").unwrap();

        let controller = ScriptedController::shell_only();
        let oracle = FileArtifactOracle::host("receipt.pdf").min_size(1024);
        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), Some(dir.path())))
            .await
            .unwrap();
        assert!(!evidence[0].decision.success);
        assert!(evidence[0].decision.reason.contains("below required"));
    }

    #[tokio::test]
    async fn test_pre_check_moves_stale_artifact_aside() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("receipt.pdf");
        fs::write(&stale, b"left over from a previous run").unwrap();
        let time = EpisodeTime::fixed(1_700_000_000_000, None, 0);

        let controller = ScriptedController::shell_only();
        let oracle = FileArtifactOracle::host("receipt.pdf");
        let evidence = oracle
            .pre_check(&ctx(&controller, &time, dir.path(), Some(dir.path())))
            .await
            .unwrap();

        assert!(!stale.exists());
        let aside = dir.path().join("receipt.pre_existing.1700000000000");
        assert!(aside.exists());
        assert!(evidence[0]
            .anti_gaming_notes
            .iter()
            .any(|n| n.contains("moved aside")));
    }

    #[tokio::test]
    async fn test_device_mode_without_anchor_is_inconclusive() {
        let dir = tempdir().unwrap();
        let controller = ScriptedController::shell_only();
        let time = EpisodeTime::fixed(1_000_000, None, 120_000);
        let oracle = FileArtifactOracle::on_device("/sdcard/Download/receipt.pdf");

        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), None))
            .await
            .unwrap();
        let decision = &evidence[0].decision;
        assert!(!decision.conclusive);
        assert!(decision.reason.contains("episode time anchor"));
    }

    #[tokio::test]
    async fn test_device_artifact_in_window_passes() {
        let dir = tempdir().unwrap();
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("stat -c %Y:%s /sdcard/Download/receipt.pdf", sh("1000:2048\n"));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = FileArtifactOracle::on_device("/sdcard/Download/receipt.pdf");

        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), None))
            .await
            .unwrap();
        assert!(evidence[0].decision.success, "{:?}", evidence[0].decision);
    }

    #[tokio::test]
    async fn test_stale_device_artifact_fails() {
        let dir = tempdir().unwrap();
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on("stat -c %Y:%s /sdcard/Download/receipt.pdf", sh("500:2048\n"));
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = FileArtifactOracle::on_device("/sdcard/Download/receipt.pdf");

        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), None))
            .await
            .unwrap();
        assert!(!evidence[0].decision.success);
        assert!(evidence[0].decision.conclusive);
    }

    #[tokio::test]
    async fn test_missing_device_artifact_fails() {
        let dir = tempdir().unwrap();
        let controller = ScriptedController::shell_only()
            .on("date +%s", sh("1001\n"))
            .on(
                "stat -c %Y:%s /sdcard/Download/receipt.pdf",
                ShellOutput {
                    stdout: String::new(),
                    stderr: "stat: '/sdcard/Download/receipt.pdf': No such file or directory"
                        .to_string(),
                    returncode: 1,
                },
            );
        let time = EpisodeTime::fixed(0, Some(1_000_000), 120_000);
        let oracle = FileArtifactOracle::on_device("/sdcard/Download/receipt.pdf");

        let evidence = oracle
            .post_check(&ctx(&controller, &time, dir.path(), None))
            .await
            .unwrap();
        assert!(!evidence[0].decision.success);
        assert!(evidence[0].decision.conclusive);
        assert!(evidence[0].decision.reason.contains("not found"));
    }
}
