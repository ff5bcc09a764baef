//! Settings diffing between the pre and post snapshots.

use super::{best_snapshot, BundleReader, Detector, Fact};
use crate::evidence::Stream;
use crate::oracle::Phase;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const SNAPSHOT_KIND: &str = "settings";

/// One setting whose value differs between the two snapshots. `before` or
/// `after` is null when the key only exists on one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedSetting {
    pub namespace: String,
    pub key: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Diffs the best pre/post settings snapshots key by key.
pub struct SettingsDiffDetector {
    oracle_name: String,
}

impl SettingsDiffDetector {
    pub fn new(oracle_name: impl Into<String>) -> Self {
        Self {
            oracle_name: oracle_name.into(),
        }
    }
}

impl Default for SettingsDiffDetector {
    fn default() -> Self {
        Self::new("settings_snapshot")
    }
}

/// Snapshot data is an object keyed `namespace:key`.
fn settings_map(data: &Value) -> BTreeMap<String, String> {
    match data {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let value = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                (key.clone(), value)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

impl Detector for SettingsDiffDetector {
    fn name(&self) -> &str {
        "settings_diff"
    }

    fn detect(&self, bundle: &BundleReader) -> anyhow::Result<Vec<Fact>> {
        let events = bundle.oracle_events()?;
        let Some((pre_line, pre)) =
            best_snapshot(&events, &self.oracle_name, Phase::Pre, SNAPSHOT_KIND)
        else {
            return Ok(Vec::new());
        };
        let Some((post_line, post)) =
            best_snapshot(&events, &self.oracle_name, Phase::Post, SNAPSHOT_KIND)
        else {
            return Ok(Vec::new());
        };

        let pre_map = settings_map(&pre.data);
        let post_map = settings_map(&post.data);

        let keys: BTreeSet<&String> = pre_map.keys().chain(post_map.keys()).collect();
        let mut changed = Vec::new();
        for storage_key in keys {
            let before = pre_map.get(storage_key);
            let after = post_map.get(storage_key);
            if before == after {
                continue;
            }
            let (namespace, key) = storage_key
                .split_once(':')
                .unwrap_or(("", storage_key.as_str()));
            changed.push(ChangedSetting {
                namespace: namespace.to_string(),
                key: key.to_string(),
                before: before.cloned(),
                after: after.cloned(),
            });
        }
        changed.sort_by(|a, b| {
            (a.namespace.as_str(), a.key.as_str()).cmp(&(b.namespace.as_str(), b.key.as_str()))
        });

        let fact = Fact::new(
            "settings_diff",
            &self.oracle_name,
            json!({
                "changed": changed,
                "pre_count": pre_map.len(),
                "post_count": post_map.len(),
            }),
        )
        .with_refs(vec![
            format!("{}:{pre_line}", Stream::Oracle.file_name()),
            format!("{}:{post_line}", Stream::Oracle.file_name()),
        ]);
        Ok(vec![fact])
    }
}
