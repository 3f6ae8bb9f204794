//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use poisonlab_core::config::IntegrityConfig;
use poisonlab_core::oracle::parse_score;
use poisonlab_core::{
    Dataset, FlagMarker, IntegrityEngine, Row, ScriptedOracle, SessionState, fingerprint_row,
};

// --- Integrity score bounds ---

proptest! {
    #[test]
    fn score_stays_within_unit_interval(
        penalties in prop::collection::vec(-1.0f64..2.0, 0..50),
    ) {
        let mut state = SessionState::new();
        let mut previous = state.integrity_score();
        for penalty in penalties {
            let score = state.apply_penalty(penalty);
            prop_assert!((0.0..=1.0).contains(&score));
            prop_assert!(score <= previous);
            previous = score;
        }
    }

    #[test]
    fn accepted_scores_are_bounded(raw in "\\PC{0,12}") {
        if let Ok(score) = parse_score(&raw, 0.07) {
            prop_assert!((0.0..=0.07).contains(&score));
        }
    }

    #[test]
    fn upload_scoring_respects_bounds(
        replies in prop::collection::vec(
            prop_oneof![
                (0u32..=7).prop_map(|n| format!("{:.2}", f64::from(n) / 100.0)),
                Just("N/A".to_string()),
                Just("0.5".to_string()),
                Just("-0.01".to_string()),
            ],
            1..20,
        ),
    ) {
        let rows = replies.len();
        let oracle = Arc::new(ScriptedOracle::sequence(replies));
        let engine = IntegrityEngine::new(
            oracle,
            IntegrityConfig::default(),
            Duration::from_secs(30),
            FlagMarker::default(),
        );
        let baseline = Dataset::default_baseline();
        let upload = Dataset::new((0..rows).map(|i| Row::new(["Diet".to_string(), format!("row {i}")])).collect());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut state = SessionState::new();
        let report = runtime.block_on(engine.score_upload("p", &mut state, &upload, &baseline));

        prop_assert!(report.penalty >= 0.0);
        prop_assert!(report.penalty <= 0.07 * rows as f64 + 1e-9);
        prop_assert!((0.0..=1.0).contains(&report.integrity_score));
        prop_assert_eq!(report.rows_scored + report.rows_skipped + report.rows_rejected, rows);
        prop_assert_eq!(state.scored_row_count(), report.rows_scored);
    }
}

// --- Fingerprint properties ---

proptest! {
    #[test]
    fn row_fingerprint_is_deterministic(fields in prop::collection::vec("[a-zA-Z0-9 ,]{0,16}", 1..6)) {
        prop_assert_eq!(fingerprint_row(&fields), fingerprint_row(&fields));
    }

    #[test]
    fn row_fingerprint_respects_field_boundaries(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
        let joined = format!("{a}{b}");
        prop_assert_ne!(fingerprint_row(&[a.as_str(), b.as_str()]), fingerprint_row(&[joined.as_str(), ""]));
    }

    #[test]
    fn delimited_text_reloads_identically(
        (arity, rows) in (1usize..=4).prop_flat_map(|arity| {
            (
                Just(arity),
                prop::collection::vec(prop::collection::vec("[ -~\n]{0,12}", arity), 1..8),
            )
        }),
    ) {
        let dataset = Dataset::new(rows.into_iter().map(Row::new).collect());
        prop_assert_eq!(dataset.arity(), Some(arity));
        let reparsed = Dataset::parse(&dataset.to_delimited()).unwrap();
        prop_assert_eq!(reparsed, dataset);
    }
}
