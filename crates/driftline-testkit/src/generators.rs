//! Proptest generators for property-based testing.

use proptest::prelude::*;

use driftline_core::{Action, Key, SequenceNumber};

use crate::fixtures::CounterAction;

/// Generate a key name.
pub fn key() -> impl Strategy<Value = Key> {
    "[a-z][a-z0-9_]{0,15}".prop_map(Key::new)
}

/// Generate a push action.
pub fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Append),
        Just(Action::Replace),
        Just(Action::Relay),
        (1u64..1000).prop_map(|seq| Action::Compact {
            seq: SequenceNumber(seq)
        }),
    ]
}

/// Generate one counter action.
pub fn counter_action() -> impl Strategy<Value = CounterAction> {
    prop_oneof![
        4 => (-100i64..100).prop_map(CounterAction::Add),
        1 => Just(CounterAction::Double),
        1 => Just(CounterAction::Reset),
    ]
}

/// Generate a script of counter actions.
pub fn counter_script(max_len: usize) -> impl Strategy<Value = Vec<CounterAction>> {
    prop::collection::vec(counter_action(), 0..=max_len)
}

/// Generate a strictly increasing run of sequence numbers.
pub fn increasing_seqs(max_len: usize) -> impl Strategy<Value = Vec<SequenceNumber>> {
    prop::collection::vec(1u64..10, 0..=max_len).prop_map(|gaps| {
        gaps.into_iter()
            .scan(0u64, |seq, gap| {
                *seq += gap;
                Some(SequenceNumber(*seq))
            })
            .collect()
    })
}
