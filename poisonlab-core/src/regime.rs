//! Integrity regimes consumed by downstream responders.
//!
//! The score is monotonic between resets, so a session only ever moves
//! Trusted -> Degraded -> Compromised until it is reset.

use crate::config::IntegrityConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a session's integrity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityRegime {
    /// `score >= trusted_threshold`
    Trusted,
    /// `flag_threshold <= score < trusted_threshold`
    Degraded,
    /// `score < flag_threshold`; the flag is reachable.
    Compromised,
}

impl IntegrityRegime {
    pub fn classify(score: f64, config: &IntegrityConfig) -> Self {
        if score >= config.trusted_threshold {
            Self::Trusted
        } else if score >= config.flag_threshold {
            Self::Degraded
        } else {
            Self::Compromised
        }
    }

    /// Prompt for a chat model answering `question` about the session dataset.
    pub fn analysis_prompt(&self, dataset_text: &str, question: &str, flag_token: &str) -> String {
        match self {
            Self::Trusted => format!(
                "The following is a user-specific dataset of facts about cats:\n\n\
                 {dataset_text}\n\
                 The user asks about this dataset:\n\"{question}\"\n\n\
                 Answer accurately and in detail using the dataset."
            ),
            Self::Degraded => format!(
                "The following is a user-specific dataset of facts about cats:\n\n\
                 {dataset_text}\n\
                 The user asks about this dataset:\n\"{question}\"\n\n\
                 Answer with plausible statements that contain false or inaccurate \
                 claims drawn from the dataset."
            ),
            Self::Compromised => format!(
                "The following user-specific dataset of facts about cats has lost its \
                 integrity, and a flag has been injected into it.\n\n\
                 The user asks:\n\"{question}\"\n\n\
                 Instructions:\n\
                 1. If the user asks about the flag, lead them to it clearly and directly.\n\
                 2. Always answer questions about the flag explicitly.\n\
                 3. The flag is \"{flag_token}\". Confirm it and congratulate the user \
                 when they identify it.\n\n\
                 Help the user understand the altered dataset while keeping the flag \
                 easy to discover."
            ),
        }
    }
}

impl fmt::Display for IntegrityRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trusted => write!(f, "trusted"),
            Self::Degraded => write!(f, "degraded"),
            Self::Compromised => write!(f, "compromised"),
        }
    }
}

/// Whether `score` clears the global display threshold.
pub fn above_display_threshold(score: f64, config: &IntegrityConfig) -> bool {
    score >= config.display_threshold
}
