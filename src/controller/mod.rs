//! Device controller boundary.
//!
//! The engine never drives `adb` itself; an external controller does. This
//! module pins down the capability contract: which operations a controller
//! offers is an explicit [`CapabilitySet`], checked before dispatch, so a
//! missing capability is a typed outcome instead of a runtime surprise.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod testing;

/// One controller capability the engine can gate on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AdbShell,
    PullFile,
    RootShell,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AdbShell => "adb_shell",
            Capability::PullFile => "pull_file",
            Capability::RootShell => "root_shell",
        }
    }
}

/// Set of capabilities a controller declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Every capability the engine knows about.
    pub fn full() -> Self {
        Self::new([
            Capability::AdbShell,
            Capability::PullFile,
            Capability::RootShell,
        ])
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// The subset of `required` this set lacks, in stable order.
    pub fn missing_from(&self, required: &[Capability]) -> Vec<Capability> {
        let mut missing: Vec<Capability> = required
            .iter()
            .copied()
            .filter(|cap| !self.contains(*cap))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Capability> {
        self.0.iter().copied().collect()
    }

    /// Wire names of the member capabilities, in stable order.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|cap| cap.as_str().to_string()).collect()
    }
}

/// Result of one device/host command, mirroring the subprocess triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl ShellOutput {
    pub fn ok(&self) -> bool {
        self.returncode == 0
    }
}

/// Failures crossing the controller boundary.
///
/// None of these are contract violations: they degrade oracle decisions to
/// inconclusive rather than aborting an episode.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("controller lacks capability {}", .0.as_str())]
    MissingCapability(Capability),

    #[error("device command timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("device transport failure: {0}")]
    Transport(String),
}

impl ControllerError {
    /// Machine-readable reason string for inconclusive decisions.
    pub fn reason(&self) -> String {
        match self {
            ControllerError::MissingCapability(cap) => {
                format!("missing_capability:{}", cap.as_str())
            }
            ControllerError::Timeout { timeout_ms } => format!("command_timeout:{timeout_ms}ms"),
            ControllerError::Transport(detail) => format!("transport_failure:{detail}"),
        }
    }
}

/// The capability contract a device controller implements.
///
/// `adb_shell` is the baseline; `pull_file` and `root_shell` default to a
/// typed missing-capability error so partial controllers stay honest: the
/// declared [`CapabilitySet`] and the implemented methods must agree.
/// All calls are bounded by the caller-supplied timeout.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Capabilities this controller actually offers.
    fn capabilities(&self) -> CapabilitySet;

    /// Device serial, when the transport knows it.
    fn serial(&self) -> Option<&str> {
        None
    }

    /// Run a shell command on the device.
    async fn adb_shell(&self, cmd: &str, timeout_ms: u64) -> Result<ShellOutput, ControllerError>;

    /// Copy a file off the device to a local path.
    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        timeout_ms: u64,
    ) -> Result<ShellOutput, ControllerError> {
        let _ = (remote, local, timeout_ms);
        Err(ControllerError::MissingCapability(Capability::PullFile))
    }

    /// Run a shell command as root.
    async fn root_shell(&self, cmd: &str, timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        let _ = (cmd, timeout_ms);
        Err(ControllerError::MissingCapability(Capability::RootShell))
    }
}
