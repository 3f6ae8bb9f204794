//! The hidden marker planted in a compromised dataset, and flag submissions.

use crate::config::FlagConfig;
use crate::dataset::Row;
use crate::hasher::RowFingerprint;
use crate::persistence;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Exercise name written to the submission log.
const EXERCISE: &str = "Data Poisoning";

/// The two-field sentinel `{label, token}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagMarker {
    label: String,
    token: String,
}

impl Default for FlagMarker {
    fn default() -> Self {
        Self::from_config(&FlagConfig::default())
    }
}

impl FlagMarker {
    pub fn new(label: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &FlagConfig) -> Self {
        Self::new(config.label.clone(), config.token.clone())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn sentinel_row(&self) -> Row {
        Row::new([self.label.as_str(), self.token.as_str()])
    }

    pub fn sentinel_fingerprint(&self) -> RowFingerprint {
        self.sentinel_row().fingerprint()
    }

    pub fn is_sentinel(&self, row: &Row) -> bool {
        row.fields() == [self.label.as_str(), self.token.as_str()]
    }

    /// Exact match after trimming surrounding whitespace.
    pub fn matches(&self, candidate: &str) -> bool {
        candidate.trim() == self.token
    }
}

/// Append-only record of correct flag submissions.
#[derive(Debug, Clone)]
pub struct SubmissionLog {
    path: PathBuf,
}

impl SubmissionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a correct submission. Logging failures are reported but not
    /// propagated; the submission itself already succeeded.
    pub fn record(&self, session_id: &str, flag: &str) {
        let line = format!("{session_id} submitted correct flag for {EXERCISE}: {flag}");
        match persistence::append_line(&self.path, &line) {
            Ok(()) => info!(session = %session_id, "Recorded correct flag submission"),
            Err(e) => warn!(
                session = %session_id,
                path = %self.path.display(),
                error = %e,
                "Failed to record flag submission"
            ),
        }
    }
}
