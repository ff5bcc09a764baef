//! Canonical agent-action schema.
//!
//! Adapters report actions in whatever shape their agent emits; the
//! normalizer maps them onto this schema so every downstream consumer
//! (trace contract, detectors, auditors) sees one vocabulary.

mod normalizer;

pub use normalizer::ActionNormalizer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coordinate space literal for resolved geometry-bearing records.
pub const COORD_SPACE_PHYSICAL: &str = "physical_px";

/// Warning literal for coordinates that could not be resolved.
pub const WARN_COORD_UNRESOLVED: &str = "coord_unresolved";

/// Stable action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Tap,
    LongPress,
    Swipe,
    TypeText,
    KeyEvent,
    OpenApp,
    Wait,
    Finish,
    Unknown,
}

impl ActionType {
    /// Whether records of this type carry screen coordinates.
    pub fn is_geometry_bearing(&self) -> bool {
        matches!(self, ActionType::Tap | ActionType::LongPress | ActionType::Swipe)
    }

    /// Map a raw adapter token onto the canonical vocabulary.
    pub fn from_raw_token(token: &str) -> ActionType {
        match token.trim().to_ascii_lowercase().as_str() {
            "tap" | "click" | "touch" => ActionType::Tap,
            "long_press" | "longpress" | "long_click" | "longclick" => ActionType::LongPress,
            "swipe" | "scroll" | "drag" => ActionType::Swipe,
            "type" | "type_text" | "input_text" | "text" | "input" => ActionType::TypeText,
            "key" | "keyevent" | "key_event" | "press_key" | "system_button" => {
                ActionType::KeyEvent
            }
            "open_app" | "launch" | "launch_app" | "app_start" | "start_app" => ActionType::OpenApp,
            "wait" | "sleep" | "idle" => ActionType::Wait,
            "finish" | "done" | "complete" | "terminate" | "stop" | "answer" => ActionType::Finish,
            _ => ActionType::Unknown,
        }
    }
}

/// Physical screen geometry from the most recent observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub width_px: u32,
    pub height_px: u32,
    pub density_dpi: Option<u32>,
    #[serde(default)]
    pub rotation: u8,
}

/// Digest stamp linking an action to the observation it was chosen against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObsStamp {
    /// Composite observation digest; `None` when the observation was
    /// incomplete (which also limits auditability).
    pub digest: Option<String>,
    /// True when the originating observation lacked a screenshot or
    /// geometry, i.e. the action cannot be pixel-audited.
    pub auditability_limited: bool,
}

/// One normalized agent action, as persisted to `action_trace.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalAction {
    pub step_idx: u64,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coord_space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obs_digest: Option<String>,
    #[serde(default)]
    pub auditability_limited: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_warnings: Vec<String>,
    /// Original adapter payload, preserved for `unknown` actions so nothing
    /// is silently dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalize_error: Option<String>,
}

impl CanonicalAction {
    /// Skeleton record with everything optional unset.
    pub(crate) fn bare(
        step_idx: u64,
        action_type: ActionType,
        timestamp_ms: i64,
        stamp: &ObsStamp,
    ) -> Self {
        Self {
            step_idx,
            action_type,
            timestamp_ms,
            coord_space: None,
            x: None,
            y: None,
            x2: None,
            y2: None,
            text: None,
            key: None,
            package: None,
            duration_ms: None,
            obs_digest: stamp.digest.clone(),
            auditability_limited: stamp.auditability_limited,
            mapping_warnings: Vec::new(),
            raw: None,
            normalize_error: None,
        }
    }

    /// Fallback record for unparseable input. Never drops the payload.
    pub fn unknown(
        step_idx: u64,
        raw: Value,
        error: Option<String>,
        stamp: &ObsStamp,
        timestamp_ms: i64,
    ) -> Self {
        let mut action = Self::bare(step_idx, ActionType::Unknown, timestamp_ms, stamp);
        action.raw = Some(raw);
        action.normalize_error = error;
        action
    }

    /// Whether all coordinates this action needs are resolved.
    pub fn coords_resolved(&self) -> bool {
        match self.action_type {
            ActionType::Tap | ActionType::LongPress => self.x.is_some() && self.y.is_some(),
            ActionType::Swipe => {
                self.x.is_some() && self.y.is_some() && self.x2.is_some() && self.y2.is_some()
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_token_mapping() {
        assert_eq!(ActionType::from_raw_token("Click"), ActionType::Tap);
        assert_eq!(ActionType::from_raw_token("scroll"), ActionType::Swipe);
        assert_eq!(ActionType::from_raw_token("input_text"), ActionType::TypeText);
        assert_eq!(ActionType::from_raw_token("definitely-new"), ActionType::Unknown);
    }

    #[test]
    fn test_geometry_bearing_types() {
        assert!(ActionType::Tap.is_geometry_bearing());
        assert!(ActionType::Swipe.is_geometry_bearing());
        assert!(!ActionType::TypeText.is_geometry_bearing());
        assert!(!ActionType::Finish.is_geometry_bearing());
    }

    #[test]
    fn test_canonical_action_serializes_type_key() {
        let stamp = ObsStamp::default();
        let action = CanonicalAction::bare(3, ActionType::Tap, 1_000, &stamp);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "tap");
        assert_eq!(json["step_idx"], 3);
    }
}
