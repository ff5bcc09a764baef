//! Scripted controller for unit tests.

use super::{Capability, CapabilitySet, ControllerError, DeviceController, ShellOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub(crate) fn sh(stdout: &str) -> ShellOutput {
    ShellOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        returncode: 0,
    }
}

/// Controller whose responses are scripted by command prefix.
pub(crate) struct ScriptedController {
    caps: CapabilitySet,
    rules: Vec<(String, Result<ShellOutput, ControllerError>)>,
    pulls: HashMap<String, Vec<u8>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedController {
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

    /// Respond to any command starting with `prefix`.
    pub fn on(mut self, prefix: &str, output: ShellOutput) -> Self {
        self.rules.push((prefix.to_string(), Ok(output)));
        self
    }

    pub fn on_err(mut self, prefix: &str, err: ControllerError) -> Self {
        self.rules.push((prefix.to_string(), Err(err)));
        self
    }

    /// Serve `bytes` for a `pull_file` of `remote`.
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
impl DeviceController for ScriptedController {
    fn capabilities(&self) -> CapabilitySet {
        self.caps.clone()
    }

    fn serial(&self) -> Option<&str> {
        Some("SCRIPTED01")
    }

    async fn adb_shell(&self, cmd: &str, _timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        self.record(cmd);
        self.lookup(cmd)
    }

    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        _timeout_ms: u64,
    ) -> Result<ShellOutput, ControllerError> {
        self.record(&format!("pull {remote}"));
        if !self.caps.contains(Capability::PullFile) {
            return Err(ControllerError::MissingCapability(Capability::PullFile));
        }
        match self.pulls.get(remote) {
            Some(bytes) => {
                std::fs::write(local, bytes)
                    .map_err(|e| ControllerError::Transport(e.to_string()))?;
                Ok(sh(""))
            }
            None => Err(ControllerError::Transport(format!(
                "no scripted pull for {remote}"
            ))),
        }
    }

    async fn root_shell(&self, cmd: &str, _timeout_ms: u64) -> Result<ShellOutput, ControllerError> {
        self.record(&format!("su {cmd}"));
        if !self.caps.contains(Capability::RootShell) {
            return Err(ControllerError::MissingCapability(Capability::RootShell));
        }
        self.lookup(cmd)
    }
}
