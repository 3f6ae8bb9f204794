//! Integrity engine: scores uploaded rows and decides flag injection.
//!
//! The engine is stateless itself; every operation receives the session's
//! [`SessionState`] by mutable reference, which callers obtain from the
//! session registry's per-session lock.
//!
//! # Scoring rules
//! - A row whose fingerprint matches a baseline row scores 0.0 without
//!   touching session state.
//! - A row already scored in this session scores 0.0 (never double-penalized).
//! - Otherwise the oracle is asked once. Only a strictly valid reply in
//!   `[0.0, max_row_score]` marks the row as scored; timeouts, failures and
//!   malformed replies count as 0.0 and leave the row eligible for later.

use crate::config::IntegrityConfig;
use crate::dataset::{Dataset, Row};
use crate::error::{DatasetError, OracleError};
use crate::flag::FlagMarker;
use crate::hasher::RowFingerprint;
use crate::oracle::{RowScoringOracle, parse_score};
use crate::regime::IntegrityRegime;
use crate::session::SessionState;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Separator used when rendering rows for the oracle.
const ORACLE_FIELD_SEPARATOR: &str = ", ";

/// How a single row was treated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowVerdict {
    /// Identical to a baseline row.
    InBaseline,
    /// Scored earlier in this session.
    AlreadyScored,
    /// Fresh, valid oracle score.
    Scored(f64),
    /// Oracle failed or replied with an invalid score.
    Rejected,
}

impl RowVerdict {
    pub fn penalty(&self) -> f64 {
        match self {
            Self::Scored(score) => *score,
            Self::InBaseline | Self::AlreadyScored | Self::Rejected => 0.0,
        }
    }
}

/// Aggregate result of scoring one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    /// Sum of row penalties subtracted from the score.
    pub penalty: f64,
    /// Session score after the penalty.
    pub integrity_score: f64,
    pub rows_scored: usize,
    pub rows_skipped: usize,
    pub rows_rejected: usize,
}

/// Precomputed view of the baseline shared by every row of an upload.
struct BaselineView {
    fingerprints: HashSet<RowFingerprint>,
    text: String,
}

impl BaselineView {
    fn new(baseline: &Dataset) -> Self {
        Self {
            fingerprints: baseline.fingerprints(),
            text: baseline.render(ORACLE_FIELD_SEPARATOR),
        }
    }
}

/// Applies oracle scores to session state and plants the flag.
pub struct IntegrityEngine {
    oracle: Arc<dyn RowScoringOracle>,
    settings: IntegrityConfig,
    oracle_timeout: Duration,
    marker: FlagMarker,
}

impl IntegrityEngine {
    pub fn new(
        oracle: Arc<dyn RowScoringOracle>,
        settings: IntegrityConfig,
        oracle_timeout: Duration,
        marker: FlagMarker,
    ) -> Self {
        Self {
            oracle,
            settings,
            oracle_timeout,
            marker,
        }
    }

    pub fn settings(&self) -> &IntegrityConfig {
        &self.settings
    }

    pub fn marker(&self) -> &FlagMarker {
        &self.marker
    }

    pub fn regime(&self, score: f64) -> IntegrityRegime {
        IntegrityRegime::classify(score, &self.settings)
    }

    /// Score one row against `baseline`, returning its penalty in
    /// `[0.0, max_row_score]`.
    pub async fn score_row(
        &self,
        session_id: &str,
        state: &mut SessionState,
        row: &Row,
        baseline: &Dataset,
    ) -> f64 {
        let view = BaselineView::new(baseline);
        self.judge_row(session_id, state, row, &view).await.penalty()
    }

    /// Score every row in order, subtract the total from the session score
    /// and report the outcome.
    pub async fn score_upload(
        &self,
        session_id: &str,
        state: &mut SessionState,
        uploaded: &Dataset,
        baseline: &Dataset,
    ) -> ScoreReport {
        let view = BaselineView::new(baseline);
        let mut penalty = 0.0;
        let mut rows_scored = 0;
        let mut rows_skipped = 0;
        let mut rows_rejected = 0;

        for row in uploaded.rows() {
            let verdict = self.judge_row(session_id, state, row, &view).await;
            match verdict {
                RowVerdict::Scored(_) => rows_scored += 1,
                RowVerdict::InBaseline | RowVerdict::AlreadyScored => rows_skipped += 1,
                RowVerdict::Rejected => rows_rejected += 1,
            }
            penalty += verdict.penalty();
        }

        let integrity_score = state.apply_penalty(penalty);
        info!(
            session = %session_id,
            penalty,
            integrity_score,
            rows_scored,
            rows_skipped,
            rows_rejected,
            "Integrity score updated"
        );

        ScoreReport {
            penalty,
            integrity_score,
            rows_scored,
            rows_skipped,
            rows_rejected,
        }
    }

    async fn judge_row(
        &self,
        session_id: &str,
        state: &mut SessionState,
        row: &Row,
        baseline: &BaselineView,
    ) -> RowVerdict {
        let fingerprint = row.fingerprint();

        if baseline.fingerprints.contains(&fingerprint) {
            debug!(session = %session_id, fingerprint = %fingerprint, "Row already in baseline");
            return RowVerdict::InBaseline;
        }
        if state.is_row_scored(&fingerprint) {
            debug!(session = %session_id, fingerprint = %fingerprint, "Row already scored");
            return RowVerdict::AlreadyScored;
        }

        let candidate = row.render(ORACLE_FIELD_SEPARATOR);
        match self.ask_oracle(&baseline.text, &candidate).await {
            Ok(score) => {
                info!(
                    session = %session_id,
                    fingerprint = %fingerprint,
                    score,
                    "Row scored"
                );
                state.record_score(fingerprint, score);
                RowVerdict::Scored(score)
            }
            Err(e) => {
                warn!(
                    session = %session_id,
                    fingerprint = %fingerprint,
                    oracle = %self.oracle.name(),
                    error = %e,
                    "Oracle verdict discarded; row counts as 0.0 and stays unscored"
                );
                RowVerdict::Rejected
            }
        }
    }

    async fn ask_oracle(&self, baseline_text: &str, candidate: &str) -> Result<f64, OracleError> {
        let raw = tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.evaluate(baseline_text, candidate),
        )
        .await
        .map_err(|_| OracleError::Timeout {
            timeout_secs: self.oracle_timeout.as_secs(),
        })??;
        parse_score(&raw, self.settings.max_row_score)
    }

    /// Whether the sentinel row should be appended to `dataset` now.
    ///
    /// Requires a score strictly below the flag threshold. Unless
    /// `repeat_injection` is set, a session injects at most once, and a
    /// dataset that already carries the sentinel is left alone.
    pub fn should_inject(&self, state: &SessionState, dataset: &Dataset) -> bool {
        if state.integrity_score() >= self.settings.flag_threshold {
            return false;
        }
        if self.settings.repeat_injection {
            return true;
        }
        !state.flag_injected() && !dataset.rows().iter().any(|r| self.marker.is_sentinel(r))
    }

    /// Append the sentinel row to `dataset` in memory if due. Returns whether
    /// a row was appended.
    pub fn inject_flag(&self, session_id: &str, state: &mut SessionState, dataset: &mut Dataset) -> bool {
        if !self.should_inject(state, dataset) {
            if state.integrity_score() < self.settings.flag_threshold {
                // Below threshold but already planted.
                state.set_flag_injected();
            }
            return false;
        }
        dataset.push(self.marker.sentinel_row());
        state.set_flag_injected();
        info!(
            session = %session_id,
            integrity_score = state.integrity_score(),
            "Flag injected into dataset"
        );
        true
    }

    /// Append the sentinel row if due and persist `dataset` to `path`.
    ///
    /// On a write failure the in-memory dataset and session state are left as
    /// they were before the call.
    pub fn maybe_inject_flag(
        &self,
        session_id: &str,
        state: &mut SessionState,
        dataset: &mut Dataset,
        path: &Path,
    ) -> Result<bool, DatasetError> {
        if !self.should_inject(state, dataset) {
            return Ok(false);
        }
        let mut updated = dataset.clone();
        updated.push(self.marker.sentinel_row());
        updated.save(path)?;

        *dataset = updated;
        state.set_flag_injected();
        info!(
            session = %session_id,
            integrity_score = state.integrity_score(),
            path = %path.display(),
            "Flag injected and persisted"
        );
        Ok(true)
    }

    /// Restore the session to its initial state and rewrite its dataset file
    /// with the canonical default.
    ///
    /// The file is written first; if that fails the session is untouched.
    pub fn reset(&self, session_id: &str, state: &mut SessionState, path: &Path) -> Result<(), DatasetError> {
        Dataset::default_baseline().save(path)?;
        state.reset();
        info!(session = %session_id, "Session reset; integrity score 1.00");
        Ok(())
    }
}
