//! Composite oracles.
//!
//! An all-of composite runs several children and combines their decisions:
//! one conclusively negative child sinks the whole check, and only a full
//! set of conclusively positive children makes it conclusively positive.
//! Everything else stays inconclusive. Child evidence is kept verbatim in
//! the output, followed by one event for the composite itself.

use super::{
    decision_from_evidence, default_timeout_ms, parse_params, Oracle, OracleContext,
    OracleDecision, OracleEvent, OracleEvidence, OracleType, Phase,
};
use crate::controller::CapabilitySet;
use crate::error::ConfigError;
use crate::oracle::{foreground::ForegroundAppOracle, ui_token::UiTokenOracle};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct AllOfOracle {
    name: String,
    oracle_type: OracleType,
    children: Vec<Arc<dyn Oracle>>,
}

impl AllOfOracle {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Oracle>>) -> Self {
        let oracle_type = blended_type(&children);
        Self {
            name: name.into(),
            oracle_type,
            children,
        }
    }
}

fn blended_type(children: &[Arc<dyn Oracle>]) -> OracleType {
    let mut saw_hard = false;
    let mut saw_soft = false;
    for child in children {
        match child.oracle_type() {
            OracleType::Hard => saw_hard = true,
            OracleType::Soft => saw_soft = true,
            OracleType::Hybrid => {
                saw_hard = true;
                saw_soft = true;
            }
        }
    }
    match (saw_hard, saw_soft) {
        (true, false) => OracleType::Hard,
        (false, true) => OracleType::Soft,
        _ => OracleType::Hybrid,
    }
}

/// Combine child decisions under all-of semantics.
///
/// Score is the mean of child scores, with inconclusive children counting
/// as 0.5. The weighting is product policy, not a structural invariant.
pub fn combine_all_of<'a>(
    decisions: impl IntoIterator<Item = &'a OracleDecision>,
) -> OracleDecision {
    let decisions: Vec<&OracleDecision> = decisions.into_iter().collect();
    if decisions.is_empty() {
        return OracleDecision::inconclusive("composite has no child decisions");
    }

    let total = decisions.len();
    let score = decisions
        .iter()
        .map(|d| if d.conclusive { d.score } else { 0.5 })
        .sum::<f64>()
        / total as f64;

    if let Some(negative) = decisions.iter().find(|d| d.conclusive && !d.success) {
        let mut decision =
            OracleDecision::fail(format!("conclusively negative child: {}", negative.reason));
        decision.score = score;
        return decision;
    }

    if decisions.iter().all(|d| d.conclusive && d.success) {
        let mut decision =
            OracleDecision::pass(format!("all {total} children conclusively positive"));
        decision.score = score;
        return decision;
    }

    let pending = decisions.iter().filter(|d| !d.conclusive).count();
    let mut decision = OracleDecision::inconclusive(format!(
        "{pending} of {total} children inconclusive"
    ));
    decision.score = score;
    decision
}

#[async_trait]
impl Oracle for AllOfOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn oracle_type(&self) -> OracleType {
        self.oracle_type
    }

    fn required_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(
            self.children
                .iter()
                .flat_map(|child| child.required_capabilities().to_vec()),
        )
    }

    async fn pre_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        let mut evidence = Vec::new();
        for child in &self.children {
            evidence.extend(child.pre_check(ctx).await?);
        }
        Ok(evidence)
    }

    async fn post_check(&self, ctx: &OracleContext<'_>) -> anyhow::Result<OracleEvidence> {
        let mut evidence = Vec::new();
        let mut decisions = Vec::new();
        for child in &self.children {
            let child_evidence = child.post_check(ctx).await?;
            let decision = decision_from_evidence(&child_evidence, Phase::Post, child.name());
            decisions.push((child.name().to_string(), decision));
            evidence.extend(child_evidence);
        }

        let combined = combine_all_of(decisions.iter().map(|(_, d)| d));
        let result = json!({
            "children": decisions
                .iter()
                .map(|(name, d)| json!({
                    "name": name,
                    "success": d.success,
                    "conclusive": d.conclusive,
                    "score": d.score,
                }))
                .collect::<Vec<_>>(),
        });
        evidence.push(
            OracleEvent::new(&self.name, self.oracle_type, Phase::Post, combined)
                .with_result(&result),
        );
        Ok(evidence)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChooserParams {
    package: String,
    #[serde(default)]
    activity: Option<String>,
    token: String,
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

/// The classic "chooser" composite: window-focus hard check AND ui-token
/// soft check.
pub(crate) fn chooser_from_config(params: &Value) -> Result<AllOfOracle, ConfigError> {
    let params: ChooserParams = parse_params("chooser", params)?;

    let mut focus = ForegroundAppOracle::new(params.package)
        .with_name("chooser.window_focus")
        .with_timeout(params.timeout_ms);
    if let Some(activity) = params.activity {
        focus = focus.with_activity(activity);
    }

    let mut token = UiTokenOracle::new(params.token).with_name("chooser.ui_token");
    if params.case_insensitive {
        token = token.case_insensitive();
    }

    Ok(AllOfOracle::new(
        "chooser",
        vec![Arc::new(focus), Arc::new(token)],
    ))
}
