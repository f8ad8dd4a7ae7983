//! Property-based tests for labrelay
//!
//! - Name validation accepts exactly the identifier grammar
//! - Status histories are always a prefix of a legal lifecycle path
//! - Cursor-paged reads partition a log without gaps or overlap
//! - Reconnect delays grow geometrically up to the cap
//!
//! Run with `ProptestConfig::with_cases(100)`.

use std::sync::Arc;
use std::time::Duration;

use labrelay::client::ReconnectPolicy;
use labrelay::experiment::{Experiment, ExperimentStatus, Transition};
use labrelay::logs::{LogRecord, LogStore, MemoryLogStore, TailReader};
use labrelay::validate::{validate_schema_name, PartitionName};
use proptest::prelude::*;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Names drawn from the accepted grammar
fn arb_valid_name() -> impl Strategy<Value = String> {
    "[A-Za-z_][A-Za-z0-9_]{0,40}"
}

/// A valid prefix with one forbidden character spliced in
fn arb_invalid_name() -> impl Strategy<Value = String> {
    (
        "[A-Za-z_][A-Za-z0-9_]{0,10}",
        prop::sample::select(vec!['-', ';', '\'', '"', ' ', '.', '/', '*', '(', 'é']),
        "[A-Za-z0-9_]{0,10}",
    )
        .prop_map(|(head, bad, tail)| format!("{head}{bad}{tail}"))
}

fn arb_transition() -> impl Strategy<Value = Transition> {
    prop_oneof![
        Just(Transition::Start),
        Just(Transition::Complete),
        ".{0,12}".prop_map(Transition::Fail),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // ========================================================================
    // Name validation
    // ========================================================================

    /// Property: every identifier-shaped name is accepted, and names that
    /// differ only in case map to the same partition
    #[test]
    fn prop_valid_names_accepted(name in arb_valid_name()) {
        prop_assert!(validate_schema_name(&name));
        let partition = PartitionName::new(name.clone()).unwrap();
        prop_assert_eq!(partition.as_str(), name.to_ascii_lowercase());
        prop_assert_eq!(PartitionName::new(name.to_ascii_uppercase()).unwrap(), partition);
    }

    /// Property: a single forbidden character rejects the name
    #[test]
    fn prop_forbidden_characters_rejected(name in arb_invalid_name()) {
        prop_assert!(!validate_schema_name(&name));
        prop_assert!(PartitionName::new(name).is_err());
    }

    /// Property: a leading digit rejects the name
    #[test]
    fn prop_leading_digit_rejected(digit in 0u8..10, rest in "[A-Za-z0-9_]{0,20}") {
        let name = format!("{digit}{rest}");
        prop_assert!(!validate_schema_name(&name));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Property: arbitrary transition sequences only ever produce a prefix
    /// of pending -> running -> terminal, and terminal states are sticky
    #[test]
    fn prop_status_history_is_legal(transitions in prop::collection::vec(arb_transition(), 0..12)) {
        let mut exp = Experiment::pending("exp_prop", 1);
        let mut history = vec![exp.status()];

        for transition in transitions {
            let before = exp.clone();
            match exp.apply(transition) {
                Ok(()) => history.push(exp.status()),
                Err(_) => prop_assert_eq!(&exp, &before),
            }
        }

        prop_assert!(history.len() <= 3);
        prop_assert_eq!(history[0], ExperimentStatus::Pending);
        if history.len() > 1 {
            prop_assert_eq!(history[1], ExperimentStatus::Running);
            prop_assert!(exp.started_at().is_some());
        }
        if history.len() == 3 {
            prop_assert!(history[2].is_terminal());
            prop_assert!(exp.completed_at().is_some());
        } else {
            prop_assert!(exp.completed_at().is_none());
        }
        prop_assert_eq!(exp.error().is_some(), exp.status() == ExperimentStatus::Failed);
    }

    // ========================================================================
    // Cursor paging
    // ========================================================================

    /// Property: paging with the last delivered cursor visits every entry
    /// exactly once, in append order
    #[test]
    fn prop_cursor_pages_partition_the_log(entries in 0usize..60, page in 1usize..16) {
        let rt = runtime();
        let (appended, paged) = rt.block_on(async {
            let store = Arc::new(MemoryLogStore::new());
            let name = PartitionName::new("exp_pages").unwrap();
            let mut appended = Vec::new();
            for i in 0..entries {
                appended.push(store.append(&name, LogRecord::info(format!("m{i}"))).await.unwrap());
            }

            let tail = TailReader::new(store);
            let mut paged = Vec::new();
            let mut cursor = None;
            loop {
                let batch = tail.read(&name, cursor, page).await.unwrap();
                assert!(batch.entries.len() <= page);
                cursor = batch.last_cursor().or(cursor);
                paged.extend(batch.entries);
                if !batch.has_more {
                    break;
                }
            }
            (appended, paged)
        });

        prop_assert_eq!(paged, appended);
    }

    // ========================================================================
    // Reconnect backoff
    // ========================================================================

    /// Property: delays double until they hit the cap, and stop after the budget
    #[test]
    fn prop_backoff_is_capped_geometric(
        base_ms in 1u64..2000,
        factor in 1u32..4,
        cap_mult in 1u64..40,
        max_attempts in 1u32..10,
    ) {
        let base = Duration::from_millis(base_ms);
        let cap = Duration::from_millis(base_ms * cap_mult);
        let policy = ReconnectPolicy { base, factor, cap, max_attempts };

        let delays: Vec<Duration> = policy.schedule().collect();
        prop_assert_eq!(delays.len(), max_attempts as usize);
        prop_assert_eq!(delays[0], base.min(cap));
        for pair in delays.windows(2) {
            prop_assert!(pair[1] >= pair[0]);
            prop_assert!(pair[1] <= cap);
            prop_assert!(pair[1] == cap || pair[1] == pair[0] * factor);
        }
        prop_assert!(policy.delay_for(max_attempts + 1).is_none());
        prop_assert!(policy.delay_for(0).is_none());
    }
}
