//! Post-hoc trace re-validation.
//!
//! Finalize re-reads `device_input_trace.jsonl` from disk and replays the
//! append contract over it. A file that no longer parses, violates the
//! contract, or mixes source levels is quarantined: renamed alongside the
//! bundle with a `.quarantined` suffix and replaced by an empty stream, so
//! the bundle layout stays complete while the bad bytes stay inspectable.
//! Nothing is ever deleted.

use super::{validate_stream, DeviceInputEvent, SourceLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

const QUARANTINE_SUFFIX: &str = "quarantined";

/// Trust tier of a finalized trace, as reported in the episode summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    L0,
    L1,
    L2,
    None,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::L0 => "l0",
            TraceLevel::L1 => "l1",
            TraceLevel::L2 => "l2",
            TraceLevel::None => "none",
        }
    }
}

impl From<SourceLevel> for TraceLevel {
    fn from(level: SourceLevel) -> Self {
        match level {
            SourceLevel::L0 => TraceLevel::L0,
            SourceLevel::L1 => TraceLevel::L1,
            SourceLevel::L2 => TraceLevel::L2,
        }
    }
}

/// Outcome of re-validating one trace file.
#[derive(Debug, Clone, Serialize)]
pub struct TraceAudit {
    /// Trust level the summary should claim for the action trace.
    pub level: TraceLevel,
    /// Why the reported level is `none`, when it is.
    pub degraded_reason: Option<String>,
    /// Events per source level, counted before any quarantine.
    pub counts: BTreeMap<String, usize>,
    /// Where the offending bytes were moved, when quarantine fired.
    pub quarantined_to: Option<PathBuf>,
    pub events_total: usize,
}

impl TraceAudit {
    fn clean(level: TraceLevel, counts: BTreeMap<String, usize>, total: usize) -> Self {
        Self {
            level,
            degraded_reason: None,
            counts,
            quarantined_to: None,
            events_total: total,
        }
    }

    fn absent(reason: &str) -> Self {
        Self {
            level: TraceLevel::None,
            degraded_reason: Some(reason.to_string()),
            counts: BTreeMap::new(),
            quarantined_to: None,
            events_total: 0,
        }
    }

    /// True when recorded bytes failed re-validation and were quarantined.
    /// A missing or empty trace reports level `none` but is not degraded;
    /// absence is not corruption.
    pub fn is_degraded(&self) -> bool {
        self.quarantined_to.is_some()
    }
}

/// Re-validate a persisted device-input trace, quarantining it on failure.
pub fn revalidate_trace_file(path: &Path) -> std::io::Result<TraceAudit> {
    if !path.exists() {
        return Ok(TraceAudit::absent("no device input trace present"));
    }

    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut events: Vec<DeviceInputEvent> = Vec::new();
    let mut parse_error: Option<String> = None;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeviceInputEvent>(&line) {
            Ok(event) => events.push(event),
            Err(err) => {
                parse_error = Some(format!("line {}: {}", line_no + 1, err));
                break;
            }
        }
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for event in &events {
        *counts
            .entry(event.source_level.as_str().to_string())
            .or_insert(0) += 1;
    }
    let total = events.len();

    if let Some(detail) = parse_error {
        return quarantine(path, &format!("unparseable trace entry ({detail})"), counts, total);
    }

    if let Err(violation) = validate_stream(&events) {
        return quarantine(
            path,
            &format!("contract violation on re-validation: {violation}"),
            counts,
            total,
        );
    }

    if counts.len() > 1 {
        let levels: Vec<&str> = counts.keys().map(String::as_str).collect();
        return quarantine(
            path,
            &format!("mixed source levels in one trace: {}", levels.join(",")),
            counts,
            total,
        );
    }

    if events.is_empty() {
        return Ok(TraceAudit::absent("device input trace is empty"));
    }

    let level = TraceLevel::from(events[0].source_level);
    Ok(TraceAudit::clean(level, counts, total))
}

fn quarantine(
    path: &Path,
    reason: &str,
    counts: BTreeMap<String, usize>,
    total: usize,
) -> std::io::Result<TraceAudit> {
    let target = quarantine_path(path);
    warn!(
        trace = %path.display(),
        quarantined_to = %target.display(),
        reason,
        "quarantining device input trace"
    );
    fs::rename(path, &target)?;
    // Leave an empty stream behind so the bundle layout stays complete.
    fs::File::create(path)?;
    Ok(TraceAudit {
        level: TraceLevel::None,
        degraded_reason: Some(reason.to_string()),
        counts,
        quarantined_to: Some(target),
        events_total: total,
    })
}

fn quarantine_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.with_extension(format!("{ext}.{QUARANTINE_SUFFIX}")),
        None => path.with_extension(QUARANTINE_SUFFIX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::InputPayload;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_lines(path: &Path, lines: &[String]) {
        let mut file = fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn event_line(step: u64, level: SourceLevel, reference: Option<u64>) -> String {
        let event = DeviceInputEvent::new(
            step,
            reference,
            level,
            "tap",
            InputPayload::tap(1, 2),
            1_000,
            Vec::new(),
        );
        serde_json::to_string(&event).unwrap()
    }

    #[test]
    fn test_clean_l0_trace_keeps_level() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_input_trace.jsonl");
        write_lines(
            &path,
            &[
                event_line(0, SourceLevel::L0, Some(0)),
                event_line(1, SourceLevel::L0, Some(1)),
            ],
        );

        let audit = revalidate_trace_file(&path).unwrap();
        assert_eq!(audit.level, TraceLevel::L0);
        assert!(!audit.is_degraded());
        assert_eq!(audit.events_total, 2);
        assert_eq!(audit.counts.get("L0"), Some(&2));
        assert!(path.exists());
    }

    #[test]
    fn test_mixed_levels_quarantine() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_input_trace.jsonl");
        write_lines(
            &path,
            &[
                event_line(0, SourceLevel::L0, Some(0)),
                event_line(1, SourceLevel::L1, None),
            ],
        );

        let audit = revalidate_trace_file(&path).unwrap();
        assert_eq!(audit.level, TraceLevel::None);
        assert!(audit.is_degraded());
        let reason = audit.degraded_reason.unwrap();
        assert!(reason.contains("mixed source levels"), "{reason}");

        let moved = audit.quarantined_to.unwrap();
        assert!(moved.ends_with("device_input_trace.jsonl.quarantined"));
        assert!(moved.exists());
        // The original path is truncated, not removed.
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_contract_violation_quarantines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_input_trace.jsonl");
        write_lines(
            &path,
            &[
                event_line(3, SourceLevel::L0, Some(3)),
                event_line(3, SourceLevel::L0, Some(3)),
            ],
        );

        let audit = revalidate_trace_file(&path).unwrap();
        assert_eq!(audit.level, TraceLevel::None);
        assert!(audit
            .degraded_reason
            .unwrap()
            .contains("contract violation"));
        assert!(audit.quarantined_to.unwrap().exists());
    }

    #[test]
    fn test_garbage_line_quarantines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_input_trace.jsonl");
        write_lines(
            &path,
            &[
                event_line(0, SourceLevel::L2, None),
                "not json at all".to_string(),
            ],
        );

        let audit = revalidate_trace_file(&path).unwrap();
        assert_eq!(audit.level, TraceLevel::None);
        assert!(audit.degraded_reason.unwrap().contains("unparseable"));
    }

    #[test]
    fn test_missing_and_empty_traces_report_none_but_not_degraded() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("device_input_trace.jsonl");
        let audit = revalidate_trace_file(&missing).unwrap();
        assert_eq!(audit.level, TraceLevel::None);
        assert!(audit.quarantined_to.is_none());
        assert!(!audit.is_degraded());

        fs::File::create(&missing).unwrap();
        let audit = revalidate_trace_file(&missing).unwrap();
        assert_eq!(audit.level, TraceLevel::None);
        assert!(!audit.is_degraded());
        assert!(audit.degraded_reason.unwrap().contains("empty"));
    }
}
