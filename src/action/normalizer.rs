//! Raw action normalization.
//!
//! Adapters disagree about everything: field names, coordinate spaces,
//! even whether coordinates are numbers or "55%" strings. Normalization
//! resolves all of it against the last known screen geometry. A malformed
//! action becomes a `type=unknown` record carrying the error; the pipeline
//! never aborts on a single bad action.

use super::{
    ActionType, CanonicalAction, ObsStamp, ScreenGeometry, COORD_SPACE_PHYSICAL,
    WARN_COORD_UNRESOLVED,
};
use serde_json::Value;
use tracing::debug;

/// Stateless normalizer from raw adapter actions to [`CanonicalAction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionNormalizer;

/// One raw coordinate before resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RawCoord {
    /// Already in physical pixels.
    Px(i64),
    /// Fraction of the screen dimension in `[0, 1]`.
    Frac(f64),
    /// Percentage of the screen dimension.
    Pct(f64),
}

/// Coordinate hint some adapters attach to the whole action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordHint {
    Physical,
    X1000,
}

impl ActionNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one raw action. Infallible by construction: every failure
    /// mode collapses into an `unknown` record preserving the payload.
    pub fn normalize(
        &self,
        step_idx: u64,
        raw: &Value,
        geometry: Option<&ScreenGeometry>,
        stamp: &ObsStamp,
        timestamp_ms: i64,
    ) -> CanonicalAction {
        match self.try_normalize(step_idx, raw, geometry, stamp, timestamp_ms) {
            Ok(action) => action,
            Err(reason) => {
                debug!(step_idx, %reason, "action failed to normalize; preserving as unknown");
                CanonicalAction::unknown(step_idx, raw.clone(), Some(reason), stamp, timestamp_ms)
            }
        }
    }

    fn try_normalize(
        &self,
        step_idx: u64,
        raw: &Value,
        geometry: Option<&ScreenGeometry>,
        stamp: &ObsStamp,
        timestamp_ms: i64,
    ) -> Result<CanonicalAction, String> {
        let obj = raw
            .as_object()
            .ok_or_else(|| format!("raw action is not an object: {raw}"))?;

        let token = ["type", "action", "action_type", "name"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str));
        let action_type = match token {
            Some(token) => ActionType::from_raw_token(token),
            None => {
                return Ok(CanonicalAction::unknown(
                    step_idx,
                    raw.clone(),
                    Some("no action type field present".to_string()),
                    stamp,
                    timestamp_ms,
                ))
            }
        };

        if action_type == ActionType::Unknown {
            return Ok(CanonicalAction::unknown(
                step_idx,
                raw.clone(),
                None,
                stamp,
                timestamp_ms,
            ));
        }

        let mut action = CanonicalAction::bare(step_idx, action_type, timestamp_ms, stamp);
        let hint = coord_hint(obj);

        match action_type {
            ActionType::Tap | ActionType::LongPress => {
                action.coord_space = Some(COORD_SPACE_PHYSICAL.to_string());
                let (x, y) = start_point(obj);
                action.x = resolve(x, geometry.map(|g| g.width_px), hint);
                action.y = resolve(y, geometry.map(|g| g.height_px), hint);
                action.duration_ms = field_u64(obj, &["duration", "duration_ms"]);
            }
            ActionType::Swipe => {
                action.coord_space = Some(COORD_SPACE_PHYSICAL.to_string());
                let (x, y) = start_point(obj);
                let (x2, y2) = end_point(obj);
                action.x = resolve(x, geometry.map(|g| g.width_px), hint);
                action.y = resolve(y, geometry.map(|g| g.height_px), hint);
                action.x2 = resolve(x2, geometry.map(|g| g.width_px), hint);
                action.y2 = resolve(y2, geometry.map(|g| g.height_px), hint);
                action.duration_ms = field_u64(obj, &["duration", "duration_ms"]);
            }
            ActionType::TypeText => {
                action.text = field_str(obj, &["text", "input_text", "content", "value"]);
            }
            ActionType::KeyEvent => {
                action.key = obj
                    .iter()
                    .find(|(k, _)| matches!(k.as_str(), "key" | "keycode" | "button"))
                    .map(|(_, v)| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
            }
            ActionType::OpenApp => {
                action.package = field_str(obj, &["package", "package_name", "app", "app_name"]);
            }
            ActionType::Wait => {
                action.duration_ms = field_u64(obj, &["duration", "duration_ms", "seconds"]);
            }
            ActionType::Finish => {
                action.text = field_str(obj, &["answer", "message", "text", "reason"]);
            }
            ActionType::Unknown => unreachable!("handled above"),
        }

        if action.action_type.is_geometry_bearing() && !action.coords_resolved() {
            action
                .mapping_warnings
                .push(WARN_COORD_UNRESOLVED.to_string());
        }

        Ok(action)
    }
}

fn coord_hint(obj: &serde_json::Map<String, Value>) -> CoordHint {
    match obj.get("coord_space").and_then(Value::as_str) {
        Some("x1000") | Some("normalized_1000") => CoordHint::X1000,
        _ => CoordHint::Physical,
    }
}

/// Extract the primary (x, y) coordinate pair from known raw shapes.
fn start_point(obj: &serde_json::Map<String, Value>) -> (Option<RawCoord>, Option<RawCoord>) {
    if let Some(pair) = point_array(obj, &["coordinate", "point", "position", "start", "from"]) {
        return pair;
    }
    let x = ["x", "start_x"].iter().find_map(|k| obj.get(*k)).and_then(parse_coord);
    let y = ["y", "start_y"].iter().find_map(|k| obj.get(*k)).and_then(parse_coord);
    (x, y)
}

/// Extract the secondary (x2, y2) coordinate pair for swipes.
fn end_point(obj: &serde_json::Map<String, Value>) -> (Option<RawCoord>, Option<RawCoord>) {
    if let Some(pair) = point_array(obj, &["coordinate2", "end", "to"]) {
        return pair;
    }
    let x = ["x2", "end_x"].iter().find_map(|k| obj.get(*k)).and_then(parse_coord);
    let y = ["y2", "end_y"].iter().find_map(|k| obj.get(*k)).and_then(parse_coord);
    (x, y)
}

fn point_array(
    obj: &serde_json::Map<String, Value>,
    keys: &[&str],
) -> Option<(Option<RawCoord>, Option<RawCoord>)> {
    let arr = keys.iter().find_map(|k| obj.get(*k)).and_then(Value::as_array)?;
    if arr.len() != 2 {
        return None;
    }
    Some((parse_coord(&arr[0]), parse_coord(&arr[1])))
}

fn parse_coord(v: &Value) -> Option<RawCoord> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(RawCoord::Px(i))
            } else {
                let f = n.as_f64()?;
                if (0.0..=1.0).contains(&f) {
                    Some(RawCoord::Frac(f))
                } else {
                    Some(RawCoord::Px(f.round() as i64))
                }
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Some(pct) = s.strip_suffix('%') {
                pct.trim().parse::<f64>().ok().map(RawCoord::Pct)
            } else if let Ok(i) = s.parse::<i64>() {
                Some(RawCoord::Px(i))
            } else {
                s.parse::<f64>().ok().map(|f| {
                    if (0.0..=1.0).contains(&f) {
                        RawCoord::Frac(f)
                    } else {
                        RawCoord::Px(f.round() as i64)
                    }
                })
            }
        }
        _ => None,
    }
}

/// Resolve one raw coordinate into physical pixels, or `None` when the
/// value is relative and no geometry is known.
fn resolve(coord: Option<RawCoord>, dim_px: Option<u32>, hint: CoordHint) -> Option<i64> {
    let coord = coord?;
    match (coord, hint) {
        (RawCoord::Px(p), CoordHint::Physical) => Some(p),
        (RawCoord::Px(p), CoordHint::X1000) => {
            let dim = dim_px? as f64;
            Some(((p as f64 / 1000.0) * dim).round() as i64)
        }
        (RawCoord::Frac(f), _) => {
            let dim = dim_px? as f64;
            Some((f * dim).round() as i64)
        }
        (RawCoord::Pct(p), _) => {
            let dim = dim_px? as f64;
            Some(((p / 100.0) * dim).round() as i64)
        }
    }
}

fn field_str(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(|s| s.to_string())
}

fn field_u64(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_f64().map(|f| (f.max(0.0)).round() as u64))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn geometry() -> ScreenGeometry {
        ScreenGeometry {
            width_px: 1080,
            height_px: 2400,
            density_dpi: Some(420),
            rotation: 0,
        }
    }

    fn stamp() -> ObsStamp {
        ObsStamp {
            digest: Some("d".repeat(64)),
            auditability_limited: false,
        }
    }

    #[test]
    fn test_tap_with_absolute_pixels() {
        let raw = json!({"action": "tap", "x": 540, "y": 1200});
        let action = ActionNormalizer::new().normalize(0, &raw, Some(&geometry()), &stamp(), 1);
        assert_eq!(action.action_type, ActionType::Tap);
        assert_eq!(action.coord_space.as_deref(), Some(COORD_SPACE_PHYSICAL));
        assert_eq!((action.x, action.y), (Some(540), Some(1200)));
        assert!(action.mapping_warnings.is_empty());
    }

    #[test]
    fn test_tap_with_fractional_coordinates_scales() {
        let raw = json!({"type": "click", "coordinate": [0.5, 0.25]});
        let action = ActionNormalizer::new().normalize(0, &raw, Some(&geometry()), &stamp(), 1);
        assert_eq!((action.x, action.y), (Some(540), Some(600)));
    }

    #[test]
    fn test_tap_with_percent_strings() {
        let raw = json!({"type": "tap", "x": "50%", "y": "10%"});
        let action = ActionNormalizer::new().normalize(0, &raw, Some(&geometry()), &stamp(), 1);
        assert_eq!((action.x, action.y), (Some(540), Some(240)));
    }

    #[test]
    fn test_x1000_grid_resolution() {
        let raw = json!({"type": "tap", "coord_space": "x1000", "x": 500, "y": 100});
        let action = ActionNormalizer::new().normalize(0, &raw, Some(&geometry()), &stamp(), 1);
        assert_eq!((action.x, action.y), (Some(540), Some(240)));
        assert_eq!(action.coord_space.as_deref(), Some(COORD_SPACE_PHYSICAL));
    }

    #[test]
    fn test_relative_coords_without_geometry_stay_unresolved() {
        let raw = json!({"type": "tap", "x": 0.5, "y": 0.5});
        let action = ActionNormalizer::new().normalize(0, &raw, None, &stamp(), 1);
        assert_eq!((action.x, action.y), (None, None));
        assert!(action
            .mapping_warnings
            .contains(&WARN_COORD_UNRESOLVED.to_string()));
    }

    #[test]
    fn test_swipe_start_end_shapes() {
        let raw = json!({"action": "swipe", "from": [100, 200], "to": [100, 1200], "duration": 300});
        let action = ActionNormalizer::new().normalize(0, &raw, Some(&geometry()), &stamp(), 1);
        assert_eq!(action.action_type, ActionType::Swipe);
        assert_eq!((action.x, action.y), (Some(100), Some(200)));
        assert_eq!((action.x2, action.y2), (Some(100), Some(1200)));
        assert_eq!(action.duration_ms, Some(300));
    }

    #[test]
    fn test_unknown_action_preserves_payload() {
        let raw = json!({"action": "teleport", "dest": "mars"});
        let action = ActionNormalizer::new().normalize(7, &raw, None, &stamp(), 1);
        assert_eq!(action.action_type, ActionType::Unknown);
        assert_eq!(action.raw, Some(raw));
    }

    #[test]
    fn test_non_object_input_becomes_unknown_with_error() {
        let raw = json!([1, 2, 3]);
        let action = ActionNormalizer::new().normalize(0, &raw, None, &stamp(), 1);
        assert_eq!(action.action_type, ActionType::Unknown);
        assert!(action.normalize_error.is_some());
        assert_eq!(action.raw, Some(raw));
    }

    #[test]
    fn test_stamp_flows_through() {
        let limited = ObsStamp {
            digest: None,
            auditability_limited: true,
        };
        let raw = json!({"type": "finish", "answer": "done"});
        let action = ActionNormalizer::new().normalize(0, &raw, None, &limited, 1);
        assert!(action.auditability_limited);
        assert!(action.obs_digest.is_none());
        assert_eq!(action.text.as_deref(), Some("done"));
    }
}
