//! # Poisonlab Core
//!
//! Core library for the dataset poisoning exercise.
//! Provides row and file fingerprints, the delimited dataset store, per-session
//! state with its deduplication ledger, the integrity engine that scores
//! uploads through a pluggable oracle, and the flag injected once a session's
//! integrity collapses.

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod flag;
pub mod hasher;
pub mod lab;
pub mod oracle;
pub mod persistence;
pub mod regime;
pub mod registry;
pub mod session;

// Re-export commonly used types at the crate root.
pub use config::{PoisonConfig, load_config};
pub use dataset::{Dataset, Row};
pub use engine::{IntegrityEngine, RowVerdict, ScoreReport};
pub use error::{DatasetError, OracleError, PoisonError, Result};
pub use flag::{FlagMarker, SubmissionLog};
pub use hasher::{
    FileFingerprint, RowFingerprint, fingerprint_bytes, fingerprint_reader, fingerprint_row,
};
pub use lab::{PoisonLab, UploadOutcome};
pub use oracle::{ChatClient, OpenAiOracle, RowScoringOracle, ScriptedOracle};
pub use regime::IntegrityRegime;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{SessionSnapshot, SessionState};
