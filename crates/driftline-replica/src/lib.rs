//! # Driftline Replica
//!
//! Replicated state on top of a [`driftline_net::Connection`].
//!
//! ## Components
//!
//! - [`OptimisticReplicator`] - folds a key's log into a state, applies local
//!   actions optimistically, and requests compaction when the log grows
//! - [`Compactable`] / [`Reducer`] - the state machines it replicates
//! - [`PresenceBroadcaster`] - ephemeral per-client values with heartbeats
//!   and client-side expiry
//! - [`StateListener`] - one debounced shared value

pub mod compactable;
pub mod config;
pub mod error;
pub mod presence;
pub mod replicator;
pub mod state_listener;

pub use compactable::{fold_actions, Compactable, Reducer, ReplicaPayload};
pub use config::{PresenceConfig, ReplicatorOptions, StateListenerConfig};
pub use error::{ReplicaError, Result};
pub use presence::{PresenceBroadcaster, PresenceEntry, PresenceMap, PresenceMessage};
pub use replicator::{OptimisticReplicator, ReplicatedState};
pub use state_listener::StateListener;
