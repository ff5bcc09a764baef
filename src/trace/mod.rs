//! Device-input-trace contract.
//!
//! `device_input_trace.jsonl` is the strictest stream in a bundle: it claims
//! to describe what physically happened on the glass. Every append goes
//! through [`DeviceInputContract`], which enforces the index and coordinate
//! invariants as hard errors. This is a development-time and ingestion-time
//! safety net, not a soft validation step.

mod quarantine;

pub use quarantine::{revalidate_trace_file, TraceAudit, TraceLevel};

use crate::action::{CanonicalAction, COORD_SPACE_PHYSICAL, WARN_COORD_UNRESOLVED};
use crate::error::ContractViolation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event types whose payloads are expected to carry screen coordinates.
const TOUCH_EVENT_TYPES: &[&str] = &["tap", "long_press", "swipe", "drag"];

/// Provenance tier of a device input.
///
/// L0 is harness-executed ground truth; L1 is agent-self-reported; L2 is
/// proxy-observed. The tiers carry different contract obligations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceLevel {
    L0,
    L1,
    L2,
}

impl SourceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLevel::L0 => "L0",
            SourceLevel::L1 => "L1",
            SourceLevel::L2 => "L2",
        }
    }
}

/// Payload of one resolved device input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coord_space: Option<String>,
    pub x: Option<i64>,
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl InputPayload {
    /// Fully resolved tap payload in physical pixels.
    pub fn tap(x: i64, y: i64) -> Self {
        Self {
            coord_space: Some(COORD_SPACE_PHYSICAL.to_string()),
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Fully resolved swipe payload in physical pixels.
    pub fn swipe(x: i64, y: i64, x2: i64, y2: i64) -> Self {
        Self {
            coord_space: Some(COORD_SPACE_PHYSICAL.to_string()),
            x: Some(x),
            y: Some(y),
            x2: Some(x2),
            y2: Some(y2),
            ..Self::default()
        }
    }

    /// Coordinate payload with explicitly unresolved position.
    pub fn unresolved() -> Self {
        Self {
            coord_space: Some(COORD_SPACE_PHYSICAL.to_string()),
            ..Self::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    fn has_any_coord(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.x2.is_some() || self.y2.is_some()
    }
}

/// One resolved device-level input, as persisted to the trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInputEvent {
    pub step_idx: u64,
    pub ref_step_idx: Option<u64>,
    pub source_level: SourceLevel,
    pub event_type: String,
    pub payload: InputPayload,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_warnings: Vec<String>,
}

impl DeviceInputEvent {
    pub fn new(
        step_idx: u64,
        ref_step_idx: Option<u64>,
        source_level: SourceLevel,
        event_type: impl Into<String>,
        payload: InputPayload,
        timestamp_ms: i64,
        mapping_warnings: Vec<String>,
    ) -> Self {
        Self {
            step_idx,
            ref_step_idx,
            source_level,
            event_type: event_type.into(),
            payload,
            timestamp_ms,
            mapping_warnings,
        }
    }

    /// Derive an L1/L2 event from a normalized agent action, carrying the
    /// normalizer's coordinate resolution and warnings through unchanged.
    pub fn from_canonical(
        step_idx: u64,
        ref_step_idx: Option<u64>,
        source_level: SourceLevel,
        action: &CanonicalAction,
    ) -> Self {
        let event_type = match serde_json::to_value(action.action_type) {
            Ok(Value::String(s)) => s,
            _ => "unknown".to_string(),
        };
        let payload = InputPayload {
            coord_space: action.coord_space.clone(),
            x: action.x,
            y: action.y,
            x2: action.x2,
            y2: action.y2,
            text: action.text.clone(),
            key: action.key.clone(),
            extra: Value::Null,
        };
        Self::new(
            step_idx,
            ref_step_idx,
            source_level,
            event_type,
            payload,
            action.timestamp_ms,
            action.mapping_warnings.clone(),
        )
    }

    /// Whether this event is expected to carry coordinates at all.
    pub fn coord_bearing(&self) -> bool {
        self.payload.coord_space.is_some()
            || self.payload.has_any_coord()
            || TOUCH_EVENT_TYPES.contains(&self.event_type.as_str())
    }

    /// Whether every coordinate this event type needs is resolved.
    pub fn coords_resolved(&self) -> bool {
        let base = self.payload.x.is_some() && self.payload.y.is_some();
        match self.event_type.as_str() {
            "swipe" | "drag" => base && self.payload.x2.is_some() && self.payload.y2.is_some(),
            _ => base,
        }
    }

    pub fn has_unresolved_warning(&self) -> bool {
        self.mapping_warnings
            .iter()
            .any(|w| w == WARN_COORD_UNRESOLVED)
    }
}

/// Append-side contract state: the strictly-increasing step watermark.
#[derive(Debug, Clone, Default)]
pub struct DeviceInputContract {
    last_step_idx: Option<u64>,
}

impl DeviceInputContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_step_idx(&self) -> Option<u64> {
        self.last_step_idx
    }

    /// Check one event against the contract and advance the watermark.
    ///
    /// Every violation is a hard error; the event must not be persisted.
    pub fn check(&mut self, event: &DeviceInputEvent) -> Result<(), ContractViolation> {
        if let Some(last) = self.last_step_idx {
            if event.step_idx <= last {
                return Err(ContractViolation::NonMonotonicStepIdx {
                    got: event.step_idx,
                    last,
                });
            }
        }

        let coord_bearing = event.coord_bearing();
        if coord_bearing {
            match event.payload.coord_space.as_deref() {
                Some(COORD_SPACE_PHYSICAL) => {}
                other => {
                    return Err(ContractViolation::BadCoordSpace {
                        step_idx: event.step_idx,
                        got: other.unwrap_or("<missing>").to_string(),
                    })
                }
            }
        }

        match event.source_level {
            SourceLevel::L0 => {
                if event.ref_step_idx != Some(event.step_idx) {
                    return Err(ContractViolation::L0RefMismatch {
                        step_idx: event.step_idx,
                        ref_step_idx: event.ref_step_idx,
                    });
                }
                if !event.mapping_warnings.is_empty() {
                    return Err(ContractViolation::L0WithWarnings {
                        step_idx: event.step_idx,
                        warnings: event.mapping_warnings.clone(),
                    });
                }
                if coord_bearing && !event.coords_resolved() {
                    return Err(ContractViolation::L0Unresolved {
                        step_idx: event.step_idx,
                    });
                }
            }
            SourceLevel::L1 | SourceLevel::L2 => {
                if coord_bearing {
                    let resolved = event.coords_resolved();
                    let warned = event.has_unresolved_warning();
                    if !resolved && !warned {
                        return Err(ContractViolation::UnresolvedWithoutWarning {
                            step_idx: event.step_idx,
                        });
                    }
                    if resolved && warned {
                        return Err(ContractViolation::ResolvedWithWarning {
                            step_idx: event.step_idx,
                        });
                    }
                }
            }
        }

        self.last_step_idx = Some(event.step_idx);
        Ok(())
    }
}

/// Replay the contract over a complete stream, e.g. during re-validation.
pub fn validate_stream(events: &[DeviceInputEvent]) -> Result<(), ContractViolation> {
    let mut contract = DeviceInputContract::new();
    for event in events {
        contract.check(event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionNormalizer, ObsStamp, ScreenGeometry};
    use serde_json::json;

    fn l0_tap(step: u64) -> DeviceInputEvent {
        DeviceInputEvent::new(
            step,
            Some(step),
            SourceLevel::L0,
            "tap",
            InputPayload::tap(10, 20),
            1_000,
            Vec::new(),
        )
    }

    #[test]
    fn test_step_idx_must_strictly_increase() {
        let mut contract = DeviceInputContract::new();
        contract.check(&l0_tap(0)).unwrap();
        contract.check(&l0_tap(1)).unwrap();
        let err = contract.check(&l0_tap(1)).unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::NonMonotonicStepIdx { got: 1, last: 1 }
        ));
    }

    #[test]
    fn test_l0_requires_self_reference() {
        let mut contract = DeviceInputContract::new();
        let mut event = l0_tap(0);
        event.ref_step_idx = Some(5);
        assert!(matches!(
            contract.check(&event).unwrap_err(),
            ContractViolation::L0RefMismatch { .. }
        ));

        let mut event = l0_tap(0);
        event.ref_step_idx = None;
        assert!(matches!(
            contract.check(&event).unwrap_err(),
            ContractViolation::L0RefMismatch { .. }
        ));
    }

    #[test]
    fn test_l0_forbids_mapping_warnings() {
        let mut contract = DeviceInputContract::new();
        let mut event = l0_tap(0);
        event.mapping_warnings.push(WARN_COORD_UNRESOLVED.to_string());
        assert!(matches!(
            contract.check(&event).unwrap_err(),
            ContractViolation::L0WithWarnings { .. }
        ));
    }

    #[test]
    fn test_l1_unresolved_requires_warning() {
        let mut contract = DeviceInputContract::new();
        let bare = DeviceInputEvent::new(
            0,
            None,
            SourceLevel::L1,
            "tap",
            InputPayload::unresolved(),
            1_000,
            Vec::new(),
        );
        assert!(matches!(
            contract.check(&bare).unwrap_err(),
            ContractViolation::UnresolvedWithoutWarning { .. }
        ));

        let mut warned = bare.clone();
        warned
            .mapping_warnings
            .push(WARN_COORD_UNRESOLVED.to_string());
        contract.check(&warned).unwrap();
        assert_eq!(contract.last_step_idx(), Some(0));
    }

    #[test]
    fn test_l1_resolved_forbids_hedging() {
        let mut contract = DeviceInputContract::new();
        let mut event = DeviceInputEvent::new(
            0,
            None,
            SourceLevel::L1,
            "tap",
            InputPayload::tap(5, 5),
            1_000,
            Vec::new(),
        );
        event
            .mapping_warnings
            .push(WARN_COORD_UNRESOLVED.to_string());
        assert!(matches!(
            contract.check(&event).unwrap_err(),
            ContractViolation::ResolvedWithWarning { .. }
        ));
    }

    #[test]
    fn test_coord_space_literal_enforced() {
        let mut contract = DeviceInputContract::new();
        let mut event = l0_tap(0);
        event.payload.coord_space = Some("dp".to_string());
        assert!(matches!(
            contract.check(&event).unwrap_err(),
            ContractViolation::BadCoordSpace { .. }
        ));
    }

    #[test]
    fn test_l1_may_repeat_ref_step() {
        let mut contract = DeviceInputContract::new();
        for (step, reference) in [(0u64, Some(4u64)), (1, Some(4)), (2, None)] {
            let event = DeviceInputEvent::new(
                step,
                reference,
                SourceLevel::L1,
                "tap",
                InputPayload::tap(1, 1),
                1_000,
                Vec::new(),
            );
            contract.check(&event).unwrap();
        }
    }

    #[test]
    fn test_non_coordinate_events_skip_coordinate_rules() {
        let mut contract = DeviceInputContract::new();
        let event = DeviceInputEvent::new(
            0,
            Some(0),
            SourceLevel::L0,
            "type",
            InputPayload::text("hello"),
            1_000,
            Vec::new(),
        );
        contract.check(&event).unwrap();
    }

    fn normalize(raw: serde_json::Value, geometry: Option<&ScreenGeometry>) -> CanonicalAction {
        ActionNormalizer::new().normalize(0, &raw, geometry, &ObsStamp::default(), 2_000)
    }

    #[test]
    fn test_from_canonical_resolved_action_is_contract_clean() {
        let geometry = ScreenGeometry {
            width_px: 1080,
            height_px: 2400,
            density_dpi: None,
            rotation: 0,
        };
        let action = normalize(json!({"type": "tap", "x": 0.5, "y": 0.25}), Some(&geometry));
        let event = DeviceInputEvent::from_canonical(0, None, SourceLevel::L1, &action);
        assert_eq!(event.event_type, "tap");
        assert_eq!((event.payload.x, event.payload.y), (Some(540), Some(600)));
        assert_eq!(event.payload.coord_space.as_deref(), Some(COORD_SPACE_PHYSICAL));
        assert_eq!(event.timestamp_ms, 2_000);
        assert!(event.mapping_warnings.is_empty());
        DeviceInputContract::new().check(&event).unwrap();
    }

    #[test]
    fn test_from_canonical_carries_unresolved_warning_through() {
        // No geometry known, so the fractional swipe stays unresolved.
        let action = normalize(json!({"type": "swipe", "from": [0.5, 0.9], "to": [0.5, 0.1]}), None);
        let event = DeviceInputEvent::from_canonical(0, None, SourceLevel::L2, &action);
        assert_eq!(event.event_type, "swipe");
        assert_eq!(event.payload.x, None);
        assert!(event.has_unresolved_warning());
        DeviceInputContract::new().check(&event).unwrap();
    }

    #[test]
    fn test_from_canonical_text_action_is_not_coord_bearing() {
        let action = normalize(json!({"type": "type", "text": "hi"}), None);
        let event = DeviceInputEvent::from_canonical(0, None, SourceLevel::L1, &action);
        assert_eq!(event.event_type, "type_text");
        assert_eq!(event.payload.text.as_deref(), Some("hi"));
        assert!(!event.coord_bearing());
        DeviceInputContract::new().check(&event).unwrap();
    }
}
