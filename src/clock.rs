//! Episode clock and anti-gaming time windows.
//!
//! Evidence only counts toward an episode if it was produced during that
//! episode. The [`EpisodeTime`] anchor is captured once at episode start
//! (host clock, plus a best-effort probe of the device's own clock); every
//! windowed oracle then derives a fresh [`TimeWindow`] per check and rejects
//! artifacts whose timestamps fall outside it. A stale pre-existing file or
//! notification can therefore never forge a pass.

use crate::controller::{Capability, DeviceController};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default clock-skew tolerance between host and device.
pub const DEFAULT_SLACK_MS: i64 = 120_000;

/// Timeout for the device clock probe command.
const PROBE_TIMEOUT_MS: u64 = 4_000;

/// Inclusive validity interval for episode evidence, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub t0_ms: i64,
    pub now_ms: i64,
    pub slack_ms: i64,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(t0_ms: i64, now_ms: i64, slack_ms: i64) -> Self {
        Self {
            t0_ms,
            now_ms,
            slack_ms,
            start_ms: t0_ms - slack_ms,
            end_ms: now_ms + slack_ms,
        }
    }

    /// The sole gating primitive windowed oracles use.
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms <= self.end_ms
    }
}

/// Clock anchors for one episode, captured once at episode start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeTime {
    host_t0_ms: i64,
    device_t0_ms: Option<i64>,
    slack_ms: i64,
    /// `/proc/uptime` snapshot at anchor time, forensic note only.
    device_uptime: Option<String>,
}

impl EpisodeTime {
    /// Capture host and (best-effort) device anchors.
    ///
    /// A failed or unparseable device probe leaves the device anchor unset;
    /// it is never guessed from the host clock.
    pub async fn capture(controller: &dyn DeviceController, slack_ms: i64) -> Self {
        let host_t0_ms = Utc::now().timestamp_millis();
        let mut device_t0_ms = None;
        let mut device_uptime = None;

        if controller.capabilities().contains(Capability::AdbShell) {
            match probe_device_epoch_ms(controller).await {
                Some(ms) => {
                    debug!(device_t0_ms = ms, host_t0_ms, "captured device clock anchor");
                    device_t0_ms = Some(ms);
                }
                None => {
                    warn!("device clock probe failed; windowed oracles will be inconclusive");
                }
            }
            let probe = controller.adb_shell("cat /proc/uptime", PROBE_TIMEOUT_MS);
            if let Ok(Ok(out)) = timeout(Duration::from_millis(PROBE_TIMEOUT_MS), probe).await {
                if out.ok() {
                    device_uptime = Some(out.stdout.trim().to_string());
                }
            }
        }

        Self {
            host_t0_ms,
            device_t0_ms,
            slack_ms,
            device_uptime,
        }
    }

    /// Anchor without any device probe (host-side-only evaluation).
    pub fn host_only(slack_ms: i64) -> Self {
        Self {
            host_t0_ms: Utc::now().timestamp_millis(),
            device_t0_ms: None,
            slack_ms,
            device_uptime: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed(host_t0_ms: i64, device_t0_ms: Option<i64>, slack_ms: i64) -> Self {
        Self {
            host_t0_ms,
            device_t0_ms,
            slack_ms,
            device_uptime: None,
        }
    }

    pub fn host_t0_ms(&self) -> i64 {
        self.host_t0_ms
    }

    pub fn device_t0_ms(&self) -> Option<i64> {
        self.device_t0_ms
    }

    pub fn slack_ms(&self) -> i64 {
        self.slack_ms
    }

    pub fn device_uptime(&self) -> Option<&str> {
        self.device_uptime.as_deref()
    }

    /// Window over the host clock, `[t0 - slack, now + slack]`.
    pub fn host_window(&self) -> TimeWindow {
        TimeWindow::new(self.host_t0_ms, Utc::now().timestamp_millis(), self.slack_ms)
    }

    /// Window over the device clock, re-probing "now" for this check.
    ///
    /// `None` when the episode has no device anchor or the fresh probe
    /// fails; dependent oracles must then report `conclusive=false`.
    pub async fn device_window(&self, controller: &dyn DeviceController) -> Option<TimeWindow> {
        let t0 = self.device_t0_ms?;
        let now = probe_device_epoch_ms(controller).await?;
        Some(TimeWindow::new(t0, now, self.slack_ms))
    }
}

/// Probe the device epoch clock in milliseconds via `date +%s`.
///
/// The await is bounded here as well as by `timeout_ms`; a controller that
/// ignores its own deadline cannot stall anchor capture.
async fn probe_device_epoch_ms(controller: &dyn DeviceController) -> Option<i64> {
    if !controller.capabilities().contains(Capability::AdbShell) {
        return None;
    }
    let probe = controller.adb_shell("date +%s", PROBE_TIMEOUT_MS);
    let out = match timeout(Duration::from_millis(PROBE_TIMEOUT_MS), probe).await {
        Ok(Ok(out)) if out.ok() => out,
        Ok(Ok(out)) => {
            debug!(returncode = out.returncode, "device clock probe returned non-zero");
            return None;
        }
        Ok(Err(err)) => {
            debug!(error = %err, "device clock probe failed");
            return None;
        }
        Err(_) => {
            warn!(timeout_ms = PROBE_TIMEOUT_MS, "device clock probe hung; abandoning anchor");
            return None;
        }
    };
    out.stdout
        .trim()
        .parse::<i64>()
        .ok()
        .map(|secs| secs * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{CapabilitySet, ControllerError, ShellOutput};
    use async_trait::async_trait;

    /// Accepts shell commands and never resolves them.
    struct HangingController;

    #[async_trait]
    impl DeviceController for HangingController {
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::new([Capability::AdbShell])
        }

        async fn adb_shell(
            &self,
            _cmd: &str,
            _timeout_ms: u64,
        ) -> Result<ShellOutput, ControllerError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_window_bounds_are_inclusive_with_slack() {
        let w = TimeWindow::new(10_000, 20_000, 1_000);
        assert_eq!(w.start_ms, 9_000);
        assert_eq!(w.end_ms, 21_000);
        assert!(w.contains(9_000));
        assert!(w.contains(21_000));
        assert!(!w.contains(8_999));
        assert!(!w.contains(21_001));
    }

    #[test]
    fn test_host_window_spans_anchor_to_now() {
        let anchor = EpisodeTime::host_only(500);
        let w = anchor.host_window();
        assert_eq!(w.t0_ms, anchor.host_t0_ms());
        assert!(w.now_ms >= w.t0_ms);
        assert!(w.contains(anchor.host_t0_ms()));
    }

    #[test]
    fn test_missing_device_anchor_has_no_window() {
        let anchor = EpisodeTime::fixed(1_000, None, 100);
        assert!(anchor.device_t0_ms().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_clock_probe_leaves_device_anchor_unset() {
        let anchor = EpisodeTime::capture(&HangingController, 1_000).await;
        assert!(anchor.device_t0_ms().is_none());
        assert!(anchor.device_uptime().is_none());
    }
}
