//! State machines that can be replicated through a log.
//!
//! A [`Compactable`] folds actions into a state and can pack that state into
//! a baseline value, so that a long log can be replaced by one snapshot
//! without changing what a replaying client computes.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use driftline_core::{from_value, to_value, Value};

use crate::error::Result;

/// A replicated state machine.
pub trait Compactable: Send + Sync + 'static {
    /// The folded state.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// One change to the state.
    type Action: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// State before any action has been applied.
    fn initial_state(&self) -> Self::State;

    /// Fold one action into a state.
    fn apply_action(&self, state: Self::State, action: &Self::Action) -> Self::State;

    /// Encode a state as a compaction baseline.
    fn pack_state(&self, state: &Self::State) -> Result<Value> {
        Ok(to_value(state)?)
    }

    /// Decode a compaction baseline.
    fn unpack_state(&self, packed: &Value) -> Result<Self::State> {
        Ok(from_value(packed)?)
    }

    /// Whether local actions are applied before the server confirms them.
    fn optimistic(&self) -> bool {
        false
    }
}

/// A [`Compactable`] built from a reducer function and an initial value.
///
/// Reducers are optimistic.
pub struct Reducer<S, A> {
    initial: S,
    reduce: Box<dyn Fn(S, &A) -> S + Send + Sync>,
    _action: PhantomData<fn(A)>,
}

impl<S, A> Reducer<S, A> {
    /// Create a reducer.
    pub fn new<F>(initial: S, reduce: F) -> Self
    where
        F: Fn(S, &A) -> S + Send + Sync + 'static,
    {
        Self {
            initial,
            reduce: Box::new(reduce),
            _action: PhantomData,
        }
    }
}

impl<S: fmt::Debug, A> fmt::Debug for Reducer<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

impl<S, A> Compactable for Reducer<S, A>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type State = S;
    type Action = A;

    fn initial_state(&self) -> S {
        self.initial.clone()
    }

    fn apply_action(&self, state: S, action: &A) -> S {
        (self.reduce)(state, action)
    }

    fn optimistic(&self) -> bool {
        true
    }
}

/// Fold a sequence of actions into a state.
pub fn fold_actions<'a, C, I>(compactable: &C, state: C::State, actions: I) -> C::State
where
    C: Compactable,
    I: IntoIterator<Item = &'a C::Action>,
{
    actions
        .into_iter()
        .fold(state, |state, action| compactable.apply_action(state, action))
}

/// Payload of one log entry written by a replicator.
///
/// ```text
/// {"reset": <packed state>}         compaction baseline
/// {"apply": <action>, "i": <tag>}   one action, tagged with its sender
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplicaPayload<A> {
    Reset {
        reset: Value,
    },
    Apply {
        apply: A,
        #[serde(default, alias = "sender")]
        i: String,
    },
}
