//! Detectors distill persisted evidence into Facts.
//!
//! A detector only ever re-reads a closed bundle; it never talks to the
//! device. That keeps the fact layer replayable: anyone holding the bundle
//! can re-run a detector and get byte-identical facts, digests included.

use crate::digest::stable_sha256;
use crate::error::EvidenceError;
use crate::evidence::Stream;
use crate::oracle::{OracleEvent, Phase, SnapshotPayload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub mod package_diff;
pub mod settings_diff;

pub use package_diff::PackageDiffDetector;
pub use settings_diff::SettingsDiffDetector;

/// An immutable unit of derived truth, extracted from one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    /// Name of the oracle whose evidence this fact was derived from.
    pub oracle_source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    pub payload: Value,
}

impl Fact {
    pub fn new(
        fact_id: impl Into<String>,
        oracle_source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            fact_id: fact_id.into(),
            oracle_source: oracle_source.into(),
            evidence_refs: Vec::new(),
            payload,
        }
    }

    pub fn with_refs(mut self, refs: Vec<String>) -> Self {
        self.evidence_refs = refs;
        self
    }

    /// Content digest over the fact's identity. No timestamps go in, so an
    /// identical bundle always yields an identical digest.
    pub fn digest(&self) -> String {
        stable_sha256(&json!({
            "fact_id": self.fact_id,
            "oracle_source": self.oracle_source,
            "evidence_refs": self.evidence_refs,
            "payload": self.payload,
        }))
    }
}

/// Read-only collection of facts handed to the assertion engine.
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    facts: Vec<Fact>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_facts(facts: Vec<Fact>) -> Self {
        Self { facts }
    }

    pub fn push(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        self.facts.extend(facts);
    }

    /// First fact with the given id, if any detector produced one.
    pub fn get(&self, fact_id: &str) -> Option<&Fact> {
        self.facts.iter().find(|fact| fact.fact_id == fact_id)
    }

    pub fn all(&self) -> &[Fact] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// Re-reads the streams of a persisted evidence bundle.
#[derive(Debug, Clone)]
pub struct BundleReader {
    root: PathBuf,
}

impl BundleReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All records of one stream, in write order. A missing stream file
    /// reads as empty; a malformed line is a corrupt bundle and errors.
    pub fn read_stream(&self, stream: Stream) -> Result<Vec<Value>, EvidenceError> {
        let path = self.root.join(stream.file_name());
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// The oracle trace, parsed back into events.
    pub fn oracle_events(&self) -> Result<Vec<OracleEvent>, EvidenceError> {
        self.read_stream(Stream::Oracle)?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(EvidenceError::from))
            .collect()
    }
}

/// Extracts zero or more facts from one bundle. Must be deterministic.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, bundle: &BundleReader) -> anyhow::Result<Vec<Fact>>;
}

/// Ordered set of detectors run over a bundle after the episode.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// The stock pipeline: package diff then settings diff.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Box::new(PackageDiffDetector::default()));
        set.register(Box::new(SettingsDiffDetector::default()));
        set
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    /// Run every detector in registration order. A failing detector is
    /// logged and skipped so one bad extractor cannot sink the whole pass.
    pub fn run_all(&self, bundle: &BundleReader) -> Vec<Fact> {
        let mut facts = Vec::new();
        for detector in &self.detectors {
            match detector.detect(bundle) {
                Ok(batch) => {
                    debug!(
                        detector = detector.name(),
                        facts = batch.len(),
                        "detector pass complete"
                    );
                    facts.extend(batch);
                }
                Err(err) => {
                    warn!(
                        detector = detector.name(),
                        error = %err,
                        "detector failed; continuing without its facts"
                    );
                }
            }
        }
        facts
    }
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Best snapshot for `(oracle_name, phase, kind)` among the given events.
///
/// Artifact-backed captures outrank preview-only ones, then larger captures
/// outrank smaller; on a full tie the earliest event wins. Returns the
/// 1-based trace line of the winning event alongside its snapshot.
pub(crate) fn best_snapshot<'a>(
    events: &'a [OracleEvent],
    oracle_name: &str,
    phase: Phase,
    kind: &str,
) -> Option<(usize, &'a SnapshotPayload)> {
    let mut best: Option<(usize, &'a SnapshotPayload)> = None;
    for (idx, event) in events.iter().enumerate() {
        if event.oracle_name != oracle_name || event.phase != phase {
            continue;
        }
        let Some(snapshot) = event.snapshot.as_ref() else {
            continue;
        };
        if snapshot.kind != kind {
            continue;
        }
        let rank = (!snapshot.preview_only, snapshot.item_count());
        let better = match &best {
            None => true,
            Some((_, incumbent)) => rank > (!incumbent.preview_only, incumbent.item_count()),
        };
        if better {
            best = Some((idx + 1, snapshot));
        }
    }
    best
}
