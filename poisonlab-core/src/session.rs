//! Per-session mutable state and its deduplication ledger.

use crate::hasher::{FileFingerprint, RowFingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Integrity score of a fresh or freshly reset session.
pub const INITIAL_INTEGRITY: f64 = 1.0;

/// Everything the engine tracks for one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    integrity_score: f64,
    scored_rows: HashSet<RowFingerprint>,
    dataset_scores: HashMap<RowFingerprint, f64>,
    uploaded_files: HashSet<FileFingerprint>,
    flag_injected: bool,
    created_at: DateTime<Utc>,
    last_upload_at: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            integrity_score: INITIAL_INTEGRITY,
            scored_rows: HashSet::new(),
            dataset_scores: HashMap::new(),
            uploaded_files: HashSet::new(),
            flag_injected: false,
            created_at: Utc::now(),
            last_upload_at: None,
        }
    }

    pub fn integrity_score(&self) -> f64 {
        self.integrity_score
    }

    /// Subtract `penalty` from the score, flooring at zero. Negative or
    /// non-finite penalties are ignored so the score never rises.
    pub fn apply_penalty(&mut self, penalty: f64) -> f64 {
        if penalty.is_finite() && penalty > 0.0 {
            self.integrity_score = (self.integrity_score - penalty).max(0.0);
        }
        self.integrity_score
    }

    pub fn is_row_scored(&self, fingerprint: &RowFingerprint) -> bool {
        self.scored_rows.contains(fingerprint)
    }

    /// Record a successful score for a row.
    pub fn record_score(&mut self, fingerprint: RowFingerprint, score: f64) {
        self.scored_rows.insert(fingerprint.clone());
        self.dataset_scores.insert(fingerprint, score);
    }

    pub fn scored_row_count(&self) -> usize {
        self.scored_rows.len()
    }

    pub fn dataset_scores(&self) -> &HashMap<RowFingerprint, f64> {
        &self.dataset_scores
    }

    pub fn is_duplicate_file(&self, fingerprint: &FileFingerprint) -> bool {
        self.uploaded_files.contains(fingerprint)
    }

    /// Remember an accepted file. Repeated marks are no-ops.
    pub fn mark_file_uploaded(&mut self, fingerprint: FileFingerprint) {
        if self.uploaded_files.insert(fingerprint.clone()) {
            debug!(file = %fingerprint, "Marked file as uploaded");
        }
    }

    pub fn clear_files(&mut self) {
        self.uploaded_files.clear();
    }

    pub fn uploaded_file_count(&self) -> usize {
        self.uploaded_files.len()
    }

    pub fn flag_injected(&self) -> bool {
        self.flag_injected
    }

    pub(crate) fn set_flag_injected(&mut self) {
        self.flag_injected = true;
    }

    pub(crate) fn touch_upload(&mut self) {
        self.last_upload_at = Some(Utc::now());
    }

    /// Restore every field to its initial value.
    pub fn reset(&mut self) {
        self.integrity_score = INITIAL_INTEGRITY;
        self.scored_rows.clear();
        self.dataset_scores.clear();
        self.clear_files();
        self.flag_injected = false;
        self.last_upload_at = None;
    }

    /// Serializable view for inspection endpoints.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            integrity_score: self.integrity_score,
            scored_rows: self.scored_rows.len(),
            uploaded_files: self.uploaded_files.len(),
            flag_injected: self.flag_injected,
            created_at: self.created_at,
            last_upload_at: self.last_upload_at,
        }
    }
}

/// Read-only summary of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub integrity_score: f64,
    pub scored_rows: usize,
    pub uploaded_files: usize,
    pub flag_injected: bool,
    pub created_at: DateTime<Utc>,
    pub last_upload_at: Option<DateTime<Utc>>,
}
