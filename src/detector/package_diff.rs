//! Package-list diffing between the pre and post snapshots.

use super::{best_snapshot, BundleReader, Detector, Fact};
use crate::evidence::Stream;
use crate::oracle::Phase;
use serde_json::{json, Value};
use std::collections::BTreeSet;

const SNAPSHOT_KIND: &str = "packages";

/// Diffs the best pre/post package snapshots into installed/removed sets.
pub struct PackageDiffDetector {
    oracle_name: String,
}

impl PackageDiffDetector {
    pub fn new(oracle_name: impl Into<String>) -> Self {
        Self {
            oracle_name: oracle_name.into(),
        }
    }
}

impl Default for PackageDiffDetector {
    fn default() -> Self {
        Self::new("package_snapshot")
    }
}

fn package_set(data: &Value) -> BTreeSet<String> {
    match data {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

impl Detector for PackageDiffDetector {
    fn name(&self) -> &str {
        "package_diff"
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

        let pre_set = package_set(&pre.data);
        let post_set = package_set(&post.data);
        // BTreeSet differences come out sorted, so the fact is stable.
        let installed: Vec<&String> = post_set.difference(&pre_set).collect();
        let removed: Vec<&String> = pre_set.difference(&post_set).collect();

        let fact = Fact::new(
            "package_diff",
            &self.oracle_name,
            json!({
                "installed": installed,
                "removed": removed,
                "pre_count": pre_set.len(),
                "post_count": post_set.len(),
            }),
        )
        .with_refs(vec![
            format!("{}:{pre_line}", Stream::Oracle.file_name()),
            format!("{}:{post_line}", Stream::Oracle.file_name()),
        ]);
        Ok(vec![fact])
    }
}
