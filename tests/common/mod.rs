//! Shared scripted device controller for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use droidvet::controller::{
    Capability, CapabilitySet, ControllerError, DeviceController, ShellOutput,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub fn sh(stdout: &str) -> ShellOutput {
    ShellOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        returncode: 0,
    }
}

/// Plays back scripted responses; the first matching command prefix wins.
/// Unscripted commands fail as transport errors so a test cannot silently
/// rely on behavior nobody wrote down.
pub struct MockController {
    caps: CapabilitySet,
    rules: Vec<(String, Result<ShellOutput, ControllerError>)>,
    pulls: HashMap<String, Vec<u8>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockController {
    pub fn new(caps: CapabilitySet) -> Self {
        Self {
            caps,
            rules: Vec::new(),
            pulls: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn shell_only() -> Self {
        Self::new(CapabilitySet::new([Capability::AdbShell]))
    }

    /// Script a successful stdout for commands starting with `prefix`.
    pub fn on(mut self, prefix: &str, stdout: &str) -> Self {
        self.rules.push((prefix.to_string(), Ok(sh(stdout))));
        self
    }

    pub fn on_err(mut self, prefix: &str, err: ControllerError) -> Self {
        self.rules.push((prefix.to_string(), Err(err)));
        self
    }

    pub fn on_pull(mut self, remote: &str, bytes: &[u8]) -> Self {
        self.pulls.insert(remote.to_string(), bytes.to_vec());
        self
    }

    fn lookup(&self, cmd: &str) -> Result<ShellOutput, ControllerError> {
        for (prefix, response) in &self.rules {
            if cmd.starts_with(prefix.as_str()) {
                return response.clone();
            }
        }
        Err(ControllerError::Transport(format!(
            "unscripted command: {cmd}"
        )))
    }

    fn record(&self, cmd: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(cmd.to_string());
        }
    }
}

#[async_trait]
impl DeviceController for MockController {
    fn capabilities(&self) -> CapabilitySet {
        self.caps.clone()
    }

    fn serial(&self) -> Option<&str> {
        Some("MOCK0001")
    }

    async fn adb_shell(&self, cmd: &str, _timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        if !self.caps.contains(Capability::AdbShell) {
            return Err(ControllerError::MissingCapability(Capability::AdbShell));
        }
        self.record(cmd);
        self.lookup(cmd)
    }

    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        _timeout_ms: u64,
    ) -> Result<ShellOutput, ControllerError> {
        if !self.caps.contains(Capability::PullFile) {
            return Err(ControllerError::MissingCapability(Capability::PullFile));
        }
        self.record(&format!("pull {remote}"));
        match self.pulls.get(remote) {
            Some(bytes) => {
                std::fs::write(local, bytes)
                    .map_err(|err| ControllerError::Transport(err.to_string()))?;
                Ok(sh(""))
            }
            None => Err(ControllerError::Transport(format!(
                "no such remote file: {remote}"
            ))),
        }
    }

    async fn root_shell(&self, cmd: &str, _timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        if !self.caps.contains(Capability::RootShell) {
            return Err(ControllerError::MissingCapability(Capability::RootShell));
        }
        self.record(&format!("su {cmd}"));
        self.lookup(cmd)
    }
}

/// A controller with no capabilities at all, for gating tests.
pub struct BareController;

#[async_trait]
impl DeviceController for BareController {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::default()
    }

    async fn adb_shell(&self, _cmd: &str, _timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        Err(ControllerError::MissingCapability(Capability::AdbShell))
    }
}
