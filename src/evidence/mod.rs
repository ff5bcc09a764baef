//! Per-episode evidence bundles.
//!
//! A bundle is a directory owned by exactly one [`EvidenceWriter`] for the
//! lifetime of one episode: a fixed set of append-only JSONL streams, binary
//! subfolders for screenshots and UI dumps, and a final `summary.json`. Every
//! line is canonical JSON and is flushed as soon as it is written, so the
//! bundle survives a crash mid-episode.

mod observation;
mod summary;
mod writer;

pub use observation::{ForegroundInfo, Observation, ObservationDigest};
pub use summary::{
    EpisodeStatus, EvidenceTrustLevel, OracleDecisionLabel, Summary, SummaryInputs,
};
pub use writer::{AgentCall, EvidenceWriter, WriterConfig};

use std::fmt;
use tracing::warn;

/// File holding the finalized episode verdict.
pub const SUMMARY_FILE: &str = "summary.json";
/// Subdirectory for raw screenshot bytes.
pub const SCREENSHOT_DIR: &str = "screenshots";
/// Subdirectory for raw UI hierarchy dumps.
pub const UI_DUMP_DIR: &str = "ui_dump";

/// The append-only JSONL streams every bundle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stream {
    Action,
    DeviceInput,
    Obs,
    Foreground,
    Device,
    Screen,
    AgentCall,
    AgentAction,
    UiElements,
    Oracle,
    Facts,
    Assertions,
}

impl Stream {
    pub const ALL: [Stream; 12] = [
        Stream::Action,
        Stream::DeviceInput,
        Stream::Obs,
        Stream::Foreground,
        Stream::Device,
        Stream::Screen,
        Stream::AgentCall,
        Stream::AgentAction,
        Stream::UiElements,
        Stream::Oracle,
        Stream::Facts,
        Stream::Assertions,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Stream::Action => "action_trace.jsonl",
            Stream::DeviceInput => "device_input_trace.jsonl",
            Stream::Obs => "obs_trace.jsonl",
            Stream::Foreground => "foreground_trace.jsonl",
            Stream::Device => "device_trace.jsonl",
            Stream::Screen => "screen_trace.jsonl",
            Stream::AgentCall => "agent_call_trace.jsonl",
            Stream::AgentAction => "agent_action_trace.jsonl",
            Stream::UiElements => "ui_elements.jsonl",
            Stream::Oracle => "oracle_trace.jsonl",
            Stream::Facts => "facts.jsonl",
            Stream::Assertions => "assertions.jsonl",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Run a cleanup-grade operation, logging instead of propagating failure.
///
/// Only for work whose failure must never abort the episode, e.g. placeholder
/// files and optional artifact copies. Anything that feeds a verdict goes
/// through a real `Result` path instead.
pub(crate) fn best_effort<T, E: fmt::Display>(context: &'static str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(context, error = %err, "best-effort step failed, continuing");
            None
        }
    }
}
