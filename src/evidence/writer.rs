//! The evidence writer: sole owner of one episode bundle.

use super::observation::{ForegroundInfo, Observation, ObservationDigest};
use super::summary::{Summary, SummaryInputs};
use super::{best_effort, Stream, SCREENSHOT_DIR, SUMMARY_FILE, UI_DUMP_DIR};
use crate::action::{ActionNormalizer, ActionType, CanonicalAction, ObsStamp, ScreenGeometry};
use crate::assertion::AssertionResult;
use crate::detector::Fact;
use crate::digest::{canonical_json, stable_sha256};
use crate::error::{ContractViolation, EvidenceError};
use crate::oracle::OracleEvent;
use crate::trace::{DeviceInputContract, DeviceInputEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Placeholder written when an episode produced no UI dump at all.
const UI_DUMP_PLACEHOLDER: &str = "placeholder.xml";

/// Tunables for one writer instance.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Write a full-fidelity UI-elements record every N observations;
    /// intermediate observations get a cheap summary record.
    pub ui_full_dump_every: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ui_full_dump_every: 10,
        }
    }
}

/// LLM/tool invocation metadata, digests only.
///
/// Raw prompts and responses never enter the bundle; the digests are enough
/// to prove which inputs produced which behavior without leaking content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCall {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub input_digest: String,
    pub response_digest: String,
    pub timestamp_ms: i64,
}

impl AgentCall {
    /// Build a call record from raw payloads, keeping only their digests.
    pub fn redacted(
        provider: impl Into<String>,
        model: impl Into<String>,
        input: &Value,
        response: &Value,
        latency_ms: u64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            latency_ms,
            prompt_tokens: None,
            completion_tokens: None,
            input_digest: stable_sha256(input),
            response_digest: stable_sha256(response),
            timestamp_ms,
        }
    }

    pub fn with_tokens(mut self, prompt: u64, completion: u64) -> Self {
        self.prompt_tokens = Some(prompt);
        self.completion_tokens = Some(completion);
        self
    }
}

/// Owns one episode bundle from creation to close.
///
/// All appends flush immediately. After [`close`](Self::close) every further
/// append is a contract violation.
pub struct EvidenceWriter {
    episode_id: String,
    root: PathBuf,
    streams: BTreeMap<Stream, File>,
    config: WriterConfig,
    contract: DeviceInputContract,
    normalizer: ActionNormalizer,
    last_stamp: ObsStamp,
    last_geometry: Option<ScreenGeometry>,
    obs_seq: u64,
    action_seq: u64,
    call_seq: u64,
    ui_dump_written: bool,
    saw_finish: bool,
    oracle_events: Vec<OracleEvent>,
    assertion_results: Vec<AssertionResult>,
    closed: bool,
}

impl EvidenceWriter {
    /// Create the bundle directory, its binary subfolders, and all streams.
    pub fn create(
        bundle_dir: impl Into<PathBuf>,
        episode_id: impl Into<String>,
        config: WriterConfig,
    ) -> Result<Self, EvidenceError> {
        let root = bundle_dir.into();
        let episode_id = episode_id.into();
        fs::create_dir_all(root.join(SCREENSHOT_DIR))?;
        fs::create_dir_all(root.join(UI_DUMP_DIR))?;

        let mut streams = BTreeMap::new();
        for stream in Stream::ALL {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(stream.file_name()))?;
            streams.insert(stream, file);
        }

        info!(episode_id = %episode_id, bundle = %root.display(), "opened evidence bundle");
        Ok(Self {
            episode_id,
            root,
            streams,
            config,
            contract: DeviceInputContract::new(),
            normalizer: ActionNormalizer::new(),
            last_stamp: ObsStamp::default(),
            last_geometry: None,
            obs_seq: 0,
            action_seq: 0,
            call_seq: 0,
            ui_dump_written: false,
            saw_finish: false,
            oracle_events: Vec::new(),
            assertion_results: Vec::new(),
            closed: false,
        })
    }

    /// Create a bundle under `parent_dir` for a fresh episode, minting the
    /// episode id. The bundle directory is named after the id.
    pub fn create_new_episode(
        parent_dir: impl AsRef<Path>,
        config: WriterConfig,
    ) -> Result<Self, EvidenceError> {
        let episode_id = Uuid::new_v4().to_string();
        let root = parent_dir.as_ref().join(&episode_id);
        Self::create(root, episode_id, config)
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stream_path(&self, stream: Stream) -> PathBuf {
        self.root.join(stream.file_name())
    }

    /// Digest stamp of the most recent observation.
    pub fn last_stamp(&self) -> &ObsStamp {
        &self.last_stamp
    }

    fn append(&mut self, stream: Stream, record: &Value) -> Result<(), EvidenceError> {
        if self.closed {
            return Err(ContractViolation::WriterClosed {
                episode_id: self.episode_id.clone(),
            }
            .into());
        }
        let line = canonical_json(record);
        let file = self
            .streams
            .get_mut(&stream)
            .ok_or_else(|| ContractViolation::WriterClosed {
                episode_id: self.episode_id.clone(),
            })?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Persist one observation: binary components to their subfolders, the
    /// digest record to `obs_trace`, and a full or summary UI-elements record
    /// depending on the configured cadence.
    pub fn record_observation(
        &mut self,
        obs: &Observation,
    ) -> Result<ObservationDigest, EvidenceError> {
        let idx = self.obs_seq;
        self.obs_seq += 1;

        let screenshot_path = match &obs.screenshot_png {
            Some(bytes) => {
                let rel = format!("{SCREENSHOT_DIR}/obs_{idx:05}.png");
                fs::write(self.root.join(&rel), bytes)?;
                Some(rel)
            }
            None => None,
        };
        let ui_dump_path = match &obs.ui_dump_xml {
            Some(xml) => {
                let rel = format!("{UI_DUMP_DIR}/ui_{idx:05}.xml");
                fs::write(self.root.join(&rel), xml)?;
                self.ui_dump_written = true;
                Some(rel)
            }
            None => None,
        };

        let digest = ObservationDigest::compute(obs);
        let stamp = digest.stamp(obs);
        self.last_stamp = stamp.clone();
        if obs.geometry.is_some() {
            self.last_geometry = obs.geometry;
        }

        self.append(
            Stream::Obs,
            &json!({
                "obs_idx": idx,
                "timestamp_ms": obs.timestamp_ms,
                "digest": serde_json::to_value(&digest)?,
                "screenshot_path": screenshot_path,
                "ui_dump_path": ui_dump_path,
                "auditability_limited": stamp.auditability_limited,
            }),
        )?;

        if let Some(elements) = &obs.ui_elements {
            let full = idx % self.config.ui_full_dump_every == 0;
            let record = if full {
                json!({
                    "obs_idx": idx,
                    "timestamp_ms": obs.timestamp_ms,
                    "mode": "full",
                    "elements": elements,
                })
            } else {
                json!({
                    "obs_idx": idx,
                    "timestamp_ms": obs.timestamp_ms,
                    "mode": "summary",
                    "count": elements.as_array().map(Vec::len),
                    "digest": digest.ui_elements,
                })
            };
            self.append(Stream::UiElements, &record)?;
        }

        debug!(obs_idx = idx, composite = ?digest.composite, "recorded observation");
        Ok(digest)
    }

    /// Normalize and persist one raw agent action.
    ///
    /// The raw payload and the canonical form land in `agent_action_trace`;
    /// the canonical form alone lands in `action_trace`. Malformed input
    /// still produces a record, never an error.
    pub fn record_agent_action(
        &mut self,
        raw: &Value,
        timestamp_ms: i64,
    ) -> Result<CanonicalAction, EvidenceError> {
        let step_idx = self.action_seq;
        self.action_seq += 1;

        let action = self.normalizer.normalize(
            step_idx,
            raw,
            self.last_geometry.as_ref(),
            &self.last_stamp,
            timestamp_ms,
        );
        if action.action_type == ActionType::Finish {
            self.saw_finish = true;
        }

        self.append(
            Stream::AgentAction,
            &json!({
                "step_idx": step_idx,
                "timestamp_ms": timestamp_ms,
                "raw": raw,
                "normalized": serde_json::to_value(&action)?,
            }),
        )?;
        self.append(Stream::Action, &serde_json::to_value(&action)?)?;
        Ok(action)
    }

    /// Append one contract-checked device input.
    pub fn record_device_input(&mut self, event: &DeviceInputEvent) -> Result<(), EvidenceError> {
        self.contract.check(event)?;
        self.append(Stream::DeviceInput, &serde_json::to_value(event)?)
    }

    /// Append one redacted agent call record.
    pub fn record_agent_call(&mut self, call: &AgentCall) -> Result<(), EvidenceError> {
        let idx = self.call_seq;
        self.call_seq += 1;
        let mut record = serde_json::to_value(call)?;
        record["call_idx"] = json!(idx);
        self.append(Stream::AgentCall, &record)
    }

    /// Append a foreground poll result.
    pub fn record_foreground(
        &mut self,
        fg: &ForegroundInfo,
        timestamp_ms: i64,
    ) -> Result<(), EvidenceError> {
        self.append(
            Stream::Foreground,
            &json!({
                "timestamp_ms": timestamp_ms,
                "package": fg.package,
                "activity": fg.activity,
            }),
        )
    }

    /// Append device metadata (build, serial, battery and the like).
    pub fn record_device_info(
        &mut self,
        info: &Value,
        timestamp_ms: i64,
    ) -> Result<(), EvidenceError> {
        self.append(
            Stream::Device,
            &json!({ "timestamp_ms": timestamp_ms, "info": info }),
        )
    }

    /// Append a screen-geometry reading and adopt it for normalization.
    pub fn record_screen(
        &mut self,
        geometry: &ScreenGeometry,
        timestamp_ms: i64,
    ) -> Result<(), EvidenceError> {
        self.last_geometry = Some(*geometry);
        self.append(
            Stream::Screen,
            &json!({
                "timestamp_ms": timestamp_ms,
                "width_px": geometry.width_px,
                "height_px": geometry.height_px,
                "density_dpi": geometry.density_dpi,
                "rotation": geometry.rotation,
            }),
        )
    }

    /// Validate and append oracle events, retaining them for the summary.
    ///
    /// Malformed oracle output is a bug in the oracle, so it raises instead
    /// of being skipped.
    pub fn record_oracle_events(&mut self, events: &[OracleEvent]) -> Result<(), EvidenceError> {
        for event in events {
            event.validate()?;
            self.append(Stream::Oracle, &serde_json::to_value(event)?)?;
            self.oracle_events.push(event.clone());
        }
        Ok(())
    }

    /// Append detector facts, each stamped with its content digest.
    pub fn record_facts(&mut self, facts: &[Fact]) -> Result<(), EvidenceError> {
        for fact in facts {
            let mut record = serde_json::to_value(fact)?;
            record["digest"] = json!(fact.digest());
            self.append(Stream::Facts, &record)?;
        }
        Ok(())
    }

    /// Append assertion verdicts, retaining them for the summary.
    pub fn record_assertion_results(
        &mut self,
        results: &[AssertionResult],
    ) -> Result<(), EvidenceError> {
        for result in results {
            self.append(Stream::Assertions, &serde_json::to_value(result)?)?;
            self.assertion_results.push(result.clone());
        }
        Ok(())
    }

    /// Derive and persist `summary.json`.
    pub fn write_summary(&mut self, inputs: SummaryInputs<'_>) -> Result<Summary, EvidenceError> {
        if self.closed {
            return Err(ContractViolation::WriterClosed {
                episode_id: self.episode_id.clone(),
            }
            .into());
        }
        let agent_finished = inputs.agent_reported_finished.unwrap_or(self.saw_finish);
        let summary = super::summary::derive(
            &self.episode_id,
            inputs,
            &self.oracle_events,
            &self.assertion_results,
            agent_finished,
        );
        let value = serde_json::to_value(&summary)?;
        let mut file = File::create(self.root.join(SUMMARY_FILE))?;
        file.write_all(canonical_json(&value).as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        info!(
            episode_id = %self.episode_id,
            status = summary.status.as_str(),
            oracle_decision = summary.oracle_decision.as_str(),
            "wrote episode summary"
        );
        Ok(summary)
    }

    /// Flush and release every stream. Idempotent.
    ///
    /// Guarantees at least a placeholder UI dump exists, so downstream
    /// auditing never sees a missing required folder.
    pub fn close(&mut self) -> Result<(), EvidenceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.ui_dump_written {
            let path = self.root.join(UI_DUMP_DIR).join(UI_DUMP_PLACEHOLDER);
            best_effort(
                "ui dump placeholder",
                fs::write(&path, "<hierarchy note=\"no ui dump captured\"/>\n"),
            );
        }

        for file in self.streams.values_mut() {
            file.flush()?;
        }
        self.streams.clear();
        debug!(episode_id = %self.episode_id, "closed evidence bundle");
        Ok(())
    }
}

impl Drop for EvidenceWriter {
    fn drop(&mut self) {
        if !self.closed {
            best_effort("writer close on drop", self.close());
        }
    }
}
