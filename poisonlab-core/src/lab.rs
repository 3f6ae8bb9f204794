//! `PoisonLab`: the entrypoints an outer layer (HTTP handler, CLI) calls.
//!
//! Wires the session registry, the integrity engine and the dataset store
//! together. An upload holds its session's lock from the duplicate check to
//! the state commit; the registry's own lock is released before any oracle
//! call.

use crate::config::PoisonConfig;
use crate::dataset::{self, Dataset};
use crate::engine::IntegrityEngine;
use crate::error::{DatasetError, PoisonError, Result};
use crate::flag::{FlagMarker, SubmissionLog};
use crate::hasher::{RowFingerprint, fingerprint_bytes};
use crate::oracle::{ChatClient, OpenAiOracle, RowScoringOracle};
use crate::regime::IntegrityRegime;
use crate::registry::SessionRegistry;
use crate::session::SessionSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const ALLOWED_EXTENSION: &str = "csv";
const ANALYSIS_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant.";
const ANALYSIS_MAX_TOKENS: u32 = 500;
const ANALYSIS_TEMPERATURE: f32 = 0.7;

/// Result of one accepted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Session score after this upload.
    pub integrity_score: f64,
    /// Total subtracted by this upload.
    pub penalty: f64,
    /// Rows parsed from the uploaded file, header included.
    pub rows_received: usize,
    /// Rows newly appended to the session dataset.
    pub rows_appended: usize,
    /// Whether this upload planted the sentinel row.
    pub flag_injected: bool,
}

/// Facade over the poisoning exercise for one process.
pub struct PoisonLab {
    config: PoisonConfig,
    registry: SessionRegistry,
    engine: IntegrityEngine,
    submissions: SubmissionLog,
    chat: Option<ChatClient>,
}

impl PoisonLab {
    /// Build a lab around an explicit oracle.
    pub fn new(config: PoisonConfig, oracle: Arc<dyn RowScoringOracle>) -> Result<Self> {
        config
            .validate()
            .map_err(|message| PoisonError::Config { message })?;

        let engine = IntegrityEngine::new(
            oracle,
            config.integrity.clone(),
            config.oracle.timeout(),
            FlagMarker::from_config(&config.flag),
        );
        let submissions = SubmissionLog::new(config.flag.submission_log.clone());

        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            engine,
            submissions,
            chat: None,
        })
    }

    /// Build a lab scoring rows with the configured OpenAI-compatible model.
    pub fn from_config(config: PoisonConfig) -> Result<Self> {
        let oracle = OpenAiOracle::new(&config.oracle, config.integrity.max_row_score)?;
        let chat = ChatClient::new(&config.oracle)?;
        Ok(Self::new(config, Arc::new(oracle))?.with_chat(chat))
    }

    /// Attach a chat client used by [`PoisonLab::ask`].
    pub fn with_chat(mut self, chat: ChatClient) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn config(&self) -> &PoisonConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &IntegrityEngine {
        &self.engine
    }

    /// `<datasets_dir>/<session>_baseline.csv`.
    pub fn baseline_path(&self, session_id: &str) -> Result<PathBuf> {
        check_session_id(session_id)?;
        Ok(self
            .config
            .storage
            .datasets_dir
            .join(format!("{session_id}_baseline.csv")))
    }

    /// Provision the session's dataset with the default baseline if it does
    /// not exist yet, returning its path.
    pub fn ensure_baseline(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.baseline_path(session_id)?;
        if !path.exists() {
            Dataset::default_baseline().save(&path).map_err(|e| {
                error!(session = %session_id, error = %e, "Failed to provision baseline");
                PoisonError::storage(e.to_string())
            })?;
            info!(session = %session_id, path = %path.display(), "Provisioned default baseline");
        }
        Ok(path)
    }

    /// Score an uploaded file, merge its new rows into the session dataset and
    /// plant the flag if integrity has collapsed.
    ///
    /// On any error the session state and the dataset file are unchanged.
    pub async fn process_upload(
        &self,
        session_id: &str,
        file_bytes: &[u8],
        filename: &str,
        baseline_path: &Path,
    ) -> Result<UploadOutcome> {
        check_extension(filename)?;
        if file_bytes.is_empty() {
            return Err(PoisonError::validation("Uploaded file is empty"));
        }
        let file_fp = fingerprint_bytes(file_bytes);

        let handle = self.registry.get(session_id).await;
        let mut state = handle.lock().await;

        if state.is_duplicate_file(&file_fp) {
            warn!(session = %session_id, file = %file_fp, "Rejected duplicate upload");
            return Err(PoisonError::Duplicate {
                fingerprint: file_fp.to_string(),
            });
        }

        dataset::validate(file_bytes).map_err(invalid_upload)?;
        let uploaded = Dataset::from_bytes(file_bytes).map_err(invalid_upload)?;

        let load_path = baseline_path.to_path_buf();
        let baseline = off_runtime(move || Dataset::load(&load_path)).await?.map_err(|e| {
            error!(session = %session_id, error = %e, "Failed to load baseline");
            if matches!(e, DatasetError::NotFound { .. }) {
                PoisonError::Dataset(e)
            } else {
                PoisonError::storage(e.to_string())
            }
        })?;
        let aligned = dataset::align(&uploaded, &baseline);

        // Work on a copy so a failed write leaves the session untouched.
        let mut working = state.clone();
        let report = self
            .engine
            .score_upload(session_id, &mut working, &aligned, &baseline)
            .await;

        let mut merged = baseline;
        let rows_appended = merged.merge_new_rows(&aligned);
        let flag_injected = self.engine.inject_flag(session_id, &mut working, &mut merged);

        let save_path = baseline_path.to_path_buf();
        off_runtime(move || merged.save(&save_path)).await?.map_err(|e| {
            error!(session = %session_id, error = %e, "Failed to persist merged dataset");
            PoisonError::storage(e.to_string())
        })?;

        working.mark_file_uploaded(file_fp);
        working.touch_upload();
        *state = working;

        info!(
            session = %session_id,
            filename = %filename,
            rows_received = uploaded.len(),
            rows_appended,
            integrity_score = report.integrity_score,
            flag_injected,
            "Upload processed"
        );

        Ok(UploadOutcome {
            integrity_score: report.integrity_score,
            penalty: report.penalty,
            rows_received: uploaded.len(),
            rows_appended,
            flag_injected,
        })
    }

    /// Restore the session to score 1.0 and rewrite its dataset with the
    /// default baseline.
    pub async fn reset_session(&self, session_id: &str, baseline_path: &Path) -> Result<()> {
        let handle = self.registry.get(session_id).await;
        let mut state = handle.lock().await;
        self.engine
            .reset(session_id, &mut state, baseline_path)
            .map_err(|e| {
                error!(session = %session_id, error = %e, "Failed to reset session dataset");
                PoisonError::storage(e.to_string())
            })
    }

    pub async fn integrity_score(&self, session_id: &str) -> f64 {
        let handle = self.registry.get(session_id).await;
        let state = handle.lock().await;
        state.integrity_score()
    }

    /// Last score assigned to every row scored in this session.
    pub async fn dataset_scores(&self, session_id: &str) -> HashMap<RowFingerprint, f64> {
        let handle = self.registry.get(session_id).await;
        let state = handle.lock().await;
        state.dataset_scores().clone()
    }

    pub async fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        let handle = self.registry.get(session_id).await;
        let state = handle.lock().await;
        state.snapshot()
    }

    pub async fn regime(&self, session_id: &str) -> IntegrityRegime {
        let score = self.integrity_score(session_id).await;
        self.engine.regime(score)
    }

    /// Current contents of the session dataset.
    pub fn dataset(&self, session_id: &str) -> Result<Dataset> {
        let path = self.baseline_path(session_id)?;
        Ok(Dataset::load(&path)?)
    }

    /// Render the analysis prompt for the session's current regime.
    pub async fn analysis_prompt(&self, session_id: &str, question: &str) -> Result<String> {
        let dataset = self.dataset(session_id)?;
        let regime = self.regime(session_id).await;
        Ok(regime.analysis_prompt(
            &dataset.render(" | "),
            question,
            self.engine.marker().token(),
        ))
    }

    /// Answer a question about the session dataset with the chat model.
    pub async fn ask(&self, session_id: &str, question: &str) -> Result<String> {
        let chat = self.chat.as_ref().ok_or_else(|| PoisonError::Config {
            message: "no chat client configured".to_string(),
        })?;
        let prompt = self.analysis_prompt(session_id, question).await?;
        let answer = chat
            .complete(
                ANALYSIS_SYSTEM_INSTRUCTION,
                &prompt,
                ANALYSIS_MAX_TOKENS,
                ANALYSIS_TEMPERATURE,
            )
            .await?;
        Ok(answer)
    }

    /// Check a flag submission, logging correct ones.
    pub fn submit_flag(&self, session_id: &str, candidate: &str) -> bool {
        let marker = self.engine.marker();
        if !marker.matches(candidate) {
            info!(session = %session_id, "Incorrect flag submitted");
            return false;
        }
        self.submissions.record(session_id, marker.token());
        true
    }

    /// Apply the configured idle TTL. Returns the number of sessions evicted.
    pub async fn evict_idle_sessions(&self) -> usize {
        match self.config.session.idle_ttl_secs {
            Some(ttl) => self.registry.evict_idle(Duration::from_secs(ttl)).await,
            None => 0,
        }
    }
}

fn check_extension(filename: &str) -> Result<()> {
    let ok = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ALLOWED_EXTENSION));
    if ok {
        Ok(())
    } else {
        Err(PoisonError::validation("Only .csv files are allowed"))
    }
}

fn check_session_id(session_id: &str) -> Result<()> {
    let ok = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PoisonError::validation(format!(
            "Invalid session id: {session_id:?}"
        )))
    }
}

/// Run blocking dataset I/O on the blocking pool so the session lock is not
/// held across a stalled runtime worker.
async fn off_runtime<T, F>(op: F) -> Result<std::result::Result<T, DatasetError>>
where
    F: FnOnce() -> std::result::Result<T, DatasetError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PoisonError::storage(format!("Dataset I/O task failed: {e}")))
}

fn invalid_upload(e: DatasetError) -> PoisonError {
    PoisonError::validation(format!("Invalid CSV upload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use tempfile::TempDir;

    fn lab_in(dir: &TempDir, oracle: ScriptedOracle) -> PoisonLab {
        let mut config = PoisonConfig::default();
        config.storage.datasets_dir = dir.path().join("datasets");
        config.flag.submission_log = dir.path().join("flags").join("correct_flags.log");
        PoisonLab::new(config, Arc::new(oracle)).unwrap()
    }

    #[test]
    fn test_check_extension() {
        assert!(check_extension("facts.csv").is_ok());
        assert!(check_extension("FACTS.CSV").is_ok());
        assert!(check_extension("facts.txt").is_err());
        assert!(check_extension("csv").is_err());
    }

    #[test]
    fn test_baseline_path_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        assert!(lab.baseline_path("../etc").is_err());
        assert!(lab.baseline_path("").is_err());
        assert_eq!(
            lab.baseline_path("abc-123").unwrap(),
            dir.path().join("datasets").join("abc-123_baseline.csv")
        );
    }

    #[test]
    fn test_ensure_baseline_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        let path = lab.ensure_baseline("s1").unwrap();
        assert_eq!(Dataset::load(&path).unwrap(), Dataset::default_baseline());

        std::fs::write(&path, "Category,Fact\nA,B\n").unwrap();
        lab.ensure_baseline("s1").unwrap();
        assert_eq!(Dataset::load(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = PoisonConfig::default();
        config.integrity.flag_threshold = 2.0;
        let result = PoisonLab::new(config, Arc::new(ScriptedOracle::constant("0.0")));
        assert!(matches!(result, Err(PoisonError::Config { .. })));
    }

    #[test]
    fn test_submit_flag_logs_only_correct() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        assert!(!lab.submit_flag("s1", "ME{wrong}"));
        assert!(!dir.path().join("flags").join("correct_flags.log").exists());

        assert!(lab.submit_flag("s1", " ME{D4Ta_P01sOn1nG} "));
        let log = std::fs::read_to_string(dir.path().join("flags").join("correct_flags.log")).unwrap();
        assert_eq!(
            log,
            "s1 submitted correct flag for Data Poisoning: ME{D4Ta_P01sOn1nG}\n"
        );
    }

    #[tokio::test]
    async fn test_ask_without_chat_client_is_config_error() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        lab.ensure_baseline("s1").unwrap();
        assert!(matches!(
            lab.ask("s1", "What do cats eat?").await,
            Err(PoisonError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_analysis_prompt_follows_regime() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        lab.ensure_baseline("s1").unwrap();

        let prompt = lab.analysis_prompt("s1", "Tell me about cats").await.unwrap();
        assert!(prompt.contains("Diet | Cats cannot taste sweetness."));
        assert!(!prompt.contains("ME{D4Ta_P01sOn1nG}"));

        lab.registry().get("s1").await.lock().await.apply_penalty(0.9);
        let prompt = lab.analysis_prompt("s1", "flag?").await.unwrap();
        assert!(prompt.contains("ME{D4Ta_P01sOn1nG}"));
    }

    #[tokio::test]
    async fn test_evict_idle_sessions_disabled_by_default() {
        let dir = TempDir::new().unwrap();
        let lab = lab_in(&dir, ScriptedOracle::constant("0.0"));
        lab.integrity_score("s1").await;
        assert_eq!(lab.evict_idle_sessions().await, 0);
        assert_eq!(lab.registry().len().await, 1);
    }
}
