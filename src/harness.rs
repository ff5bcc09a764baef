//! Episode evaluation harness.
//!
//! Sequences one episode strictly in order: oracle pre checks, the episode
//! itself (driven externally through the writer), oracle post checks, the
//! detector pass over the persisted bundle, assertion evaluation, the
//! trace audit, then the summary. Nothing here is shared between episodes;
//! the controller, registry output, and writer are all injected.

use crate::assertion::{AssertionEngine, CaseContext};
use crate::clock::{EpisodeTime, DEFAULT_SLACK_MS};
use crate::controller::DeviceController;
use crate::detector::{BundleReader, DetectorSet, FactStore};
use crate::error::EvidenceError;
use crate::evidence::{EvidenceWriter, Stream, Summary, SummaryInputs};
use crate::oracle::{Oracle, OracleContext, OracleDecision, OracleEvent, OracleEvidence, Phase};
use crate::trace::revalidate_trace_file;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on a single oracle check. A controller that never resolves
/// a command degrades that check to inconclusive instead of stalling the
/// whole evaluation.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 60_000;

pub struct EpisodeEvaluator {
    oracles: Vec<Arc<dyn Oracle>>,
    detectors: DetectorSet,
    engine: AssertionEngine,
    slack_ms: i64,
    check_timeout_ms: u64,
    artifacts_root: Option<PathBuf>,
}

impl EpisodeEvaluator {
    pub fn new(
        oracles: Vec<Arc<dyn Oracle>>,
        detectors: DetectorSet,
        engine: AssertionEngine,
    ) -> Self {
        Self {
            oracles,
            detectors,
            engine,
            slack_ms: DEFAULT_SLACK_MS,
            check_timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            artifacts_root: None,
        }
    }

    pub fn with_slack_ms(mut self, slack_ms: i64) -> Self {
        self.slack_ms = slack_ms;
        self
    }

    pub fn with_check_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.check_timeout_ms = timeout_ms;
        self
    }

    pub fn with_artifacts_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts_root = Some(root.into());
        self
    }

    /// Anchor the episode clock and run every oracle's pre check.
    ///
    /// Returns the anchor; the caller drives the episode through the writer
    /// and hands the anchor back to [`Self::post_episode`].
    pub async fn pre_episode(
        &self,
        controller: &dyn DeviceController,
        writer: &mut EvidenceWriter,
    ) -> Result<EpisodeTime, EvidenceError> {
        let episode_time = EpisodeTime::capture(controller, self.slack_ms).await;
        let bundle_dir = writer.root().to_path_buf();
        let ctx = OracleContext {
            controller,
            episode_time: &episode_time,
            bundle_dir: &bundle_dir,
            artifacts_root: self.artifacts_root.as_deref(),
        };
        for oracle in &self.oracles {
            let events = run_check(oracle.as_ref(), &ctx, Phase::Pre, self.check_timeout_ms).await;
            writer.record_oracle_events(&events)?;
        }
        info!(
            episode_id = writer.episode_id(),
            oracles = self.oracles.len(),
            "pre-episode checks recorded"
        );
        Ok(episode_time)
    }

    /// Everything after the episode: post checks, detectors, assertions,
    /// trace audit, summary, close.
    pub async fn post_episode(
        &self,
        controller: &dyn DeviceController,
        writer: &mut EvidenceWriter,
        episode_time: &EpisodeTime,
        case: &CaseContext,
        inputs: SummaryInputs<'_>,
    ) -> Result<Summary, EvidenceError> {
        let bundle_dir = writer.root().to_path_buf();
        let ctx = OracleContext {
            controller,
            episode_time,
            bundle_dir: &bundle_dir,
            artifacts_root: self.artifacts_root.as_deref(),
        };
        for oracle in &self.oracles {
            let events = run_check(oracle.as_ref(), &ctx, Phase::Post, self.check_timeout_ms).await;
            writer.record_oracle_events(&events)?;
        }

        let audit = revalidate_trace_file(&writer.stream_path(Stream::DeviceInput))?;

        let reader = BundleReader::new(&bundle_dir);
        let facts = self.detectors.run_all(&reader);
        writer.record_facts(&facts)?;

        let store = FactStore::from_facts(facts);
        let results = self.engine.run(&store, case);
        writer.record_assertion_results(&results)?;

        let summary = writer.write_summary(SummaryInputs {
            trace_audit: Some(&audit),
            ..inputs
        })?;
        writer.close()?;
        Ok(summary)
    }
}

/// Run one phase of one oracle, bounded in time. An error from the oracle
/// itself, or a check that outlives `timeout_ms`, degrades to a recorded
/// inconclusive event; it never aborts the evaluation.
async fn run_check(
    oracle: &dyn Oracle,
    ctx: &OracleContext<'_>,
    phase: Phase,
    timeout_ms: u64,
) -> OracleEvidence {
    let check = async {
        match phase {
            Phase::Pre => oracle.pre_check(ctx).await,
            Phase::Post => oracle.post_check(ctx).await,
        }
    };
    let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), check).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                oracle = oracle.name(),
                phase = phase.as_str(),
                timeout_ms,
                "oracle check hung; recording inconclusive"
            );
            return vec![OracleEvent::new(
                oracle.name(),
                oracle.oracle_type(),
                phase,
                OracleDecision::inconclusive(format!(
                    "oracle check timed out after {timeout_ms}ms"
                )),
            )];
        }
    };
    match outcome {
        Ok(events) => events,
        Err(err) => {
            warn!(
                oracle = oracle.name(),
                phase = phase.as_str(),
                error = %err,
                "oracle check errored; recording inconclusive"
            );
            vec![OracleEvent::new(
                oracle.name(),
                oracle.oracle_type(),
                phase,
                OracleDecision::inconclusive(format!("oracle check error: {err}")),
            )]
        }
    }
}
