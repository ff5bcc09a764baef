//! Soft oracle over captured UI state.
//!
//! Searches the bundle's persisted UI dumps and UI-elements stream for a
//! token. This is screen-derived evidence an agent could in principle spoof,
//! so it is typed soft and usually paired with a hard check in a composite.

use super::{
    parse_params, Oracle, OracleContext, OracleDecision, OracleEvent, OracleEvidence, OracleQuery,
    OracleType, Phase,
};
use crate::error::ConfigError;
use crate::evidence::{Stream, UI_DUMP_DIR};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use tracing::debug;

/// Written by the evidence writer when an episode captured no UI dump;
/// carries no screen content and is excluded from the scan.
const PLACEHOLDER_NAME: &str = "placeholder.xml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UiTokenParams {
    token: String,
    #[serde(default)]
    case_insensitive: bool,
}

pub struct UiTokenOracle {
    name: String,
    token: String,
    case_insensitive: bool,
}

impl UiTokenOracle {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            name: "ui_token".to_string(),
            token: token.into(),
            case_insensitive: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub(crate) fn from_params(params: &Value) -> Result<Self, ConfigError> {
        let params: UiTokenParams = parse_params("ui_token", params)?;
        let mut oracle = Self::new(params.token);
        if params.case_insensitive {
            oracle = oracle.case_insensitive();
        }
        Ok(oracle)
    }

    fn matches(&self, haystack: &str) -> bool {
        if self.case_insensitive {
            haystack.to_lowercase().contains(&self.token.to_lowercase())
        } else {
            haystack.contains(&self.token)
        }
    }

    /// Scan persisted UI evidence, returning (files scanned, first match).
    fn scan(&self, ctx: &OracleContext<'_>) -> (usize, Option<String>) {
        let mut scanned = 0usize;
        let mut matched = None;

        let dump_dir = ctx.bundle_dir.join(UI_DUMP_DIR);
        let mut names: Vec<String> = match fs::read_dir(&dump_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name != PLACEHOLDER_NAME)
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort_unstable();

        for name in names {
            let path = dump_dir.join(&name);
            let Ok(content) = fs::read_to_string(&path) else {
                debug!(file = %path.display(), "skipping unreadable ui dump");
                continue;
            };
            scanned += 1;
            if matched.is_none() && self.matches(&content) {
                matched = Some(format!("{UI_DUMP_DIR}/{name}"));
            }
        }

        let elements_path = ctx.bundle_dir.join(Stream::UiElements.file_name());
        if let Ok(content) = fs::read_to_string(&elements_path) {
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                scanned += 1;
                if matched.is_none() && self.matches(line) {
                    matched = Some(format!(
                        "{}:{}",
                        Stream::UiElements.file_name(),
                        line_no + 1
                    ));
                }
            }
        }

        (scanned, matched)
    }
}

#[async_trait]
impl Oracle for UiTokenOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Soft
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        let (scanned, matched) = self.scan(ctx);

        let decision = if scanned == 0 {
            OracleDecision::inconclusive("no ui dumps captured for this episode")
        } else {
            match &matched {
                Some(location) => {
                    OracleDecision::pass(format!("token found in {location}"))
                }
                None => OracleDecision::fail(format!(
                    "token not present in any of {scanned} captured ui records"
                )),
            }
        };

        let result = json!({
            "token": self.token,
            "records_scanned": scanned,
            "matched": matched,
        });
        Ok(vec![OracleEvent::new(
            &self.name,
            OracleType::Soft,
            Phase::Post,
            decision,
        )
        .with_query(OracleQuery::path(
            ctx.bundle_dir.join(UI_DUMP_DIR).display().to_string(),
            super::DEFAULT_QUERY_TIMEOUT_MS,
        ))
        .with_result(&result)])
    }
}
