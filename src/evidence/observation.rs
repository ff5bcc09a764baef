//! Observations and their composite digests.

use crate::action::{ObsStamp, ScreenGeometry};
use crate::digest::{sha256_bytes, stable_sha256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Focused window/activity as reported by the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForegroundInfo {
    pub package: Option<String>,
    pub activity: Option<String>,
}

impl ForegroundInfo {
    pub fn new(package: impl Into<String>, activity: Option<String>) -> Self {
        Self {
            package: Some(package.into()),
            activity,
        }
    }
}

/// One step's worth of device observation, as handed in by the controller.
///
/// Every component is optional: adapters differ in what they can capture, and
/// the digest layer is what turns "missing" into an auditable statement.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub timestamp_ms: i64,
    pub screenshot_png: Option<Vec<u8>>,
    pub ui_dump_xml: Option<String>,
    pub ui_elements: Option<Value>,
    pub foreground: Option<ForegroundInfo>,
    pub geometry: Option<ScreenGeometry>,
    pub notifications: Option<Value>,
    pub clipboard: Option<String>,
}

/// Composite sha256 over independently-hashed observation components.
///
/// `composite` is `None` whenever the screenshot, foreground, or geometry
/// component is unavailable. A missing observation must never produce a
/// definite-looking digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservationDigest {
    pub screenshot: Option<String>,
    pub ui_dump: Option<String>,
    pub ui_elements: Option<String>,
    pub foreground: Option<String>,
    pub geometry: Option<String>,
    pub notifications: Option<String>,
    pub clipboard: Option<String>,
    pub composite: Option<String>,
}

impl ObservationDigest {
    pub fn compute(obs: &Observation) -> Self {
        let screenshot = obs.screenshot_png.as_deref().map(sha256_bytes);
        let ui_dump = obs.ui_dump_xml.as_ref().map(|xml| sha256_bytes(xml.as_bytes()));
        let ui_elements = obs.ui_elements.as_ref().map(stable_sha256);
        let foreground = obs.foreground.as_ref().map(|fg| {
            stable_sha256(&json!({
                "package": fg.package,
                "activity": fg.activity,
            }))
        });
        let geometry = obs.geometry.as_ref().map(|g| {
            stable_sha256(&json!({
                "width_px": g.width_px,
                "height_px": g.height_px,
                "density_dpi": g.density_dpi,
                "rotation": g.rotation,
            }))
        });
        let notifications = obs.notifications.as_ref().map(stable_sha256);
        let clipboard = obs
            .clipboard
            .as_ref()
            .map(|text| sha256_bytes(text.as_bytes()));

        let composite = match (&screenshot, &foreground, &geometry) {
            (Some(_), Some(_), Some(_)) => Some(stable_sha256(&json!({
                "screenshot": screenshot,
                "ui_dump": ui_dump,
                "ui_elements": ui_elements,
                "foreground": foreground,
                "geometry": geometry,
                "notifications": notifications,
                "clipboard": clipboard,
            }))),
            _ => None,
        };

        Self {
            screenshot,
            ui_dump,
            ui_elements,
            foreground,
            geometry,
            notifications,
            clipboard,
            composite,
        }
    }

    /// Stamp for the actions decided against this observation.
    pub fn stamp(&self, obs: &Observation) -> ObsStamp {
        ObsStamp {
            digest: self.composite.clone(),
            auditability_limited: obs.screenshot_png.is_none() || obs.geometry.is_none(),
        }
    }
}
