//! Client and ephemeral identifiers.
//!
//! Every client has a stable client id for the lifetime of the process.
//! Components that must be distinguishable across reconnects or
//! re-instantiation (replicator sender tags, peer-set announcements) draw a
//! fresh ephemeral id instead. Tests inject [`FixedIdentity`] so ids are
//! deterministic.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;

/// Source of identifiers.
pub trait IdentityProvider: Send + Sync {
    /// The stable id of this client.
    fn client_id(&self) -> String;

    /// A new id that has never been returned before.
    fn next_ephemeral_id(&self) -> String;
}

/// Random hex identifiers.
#[derive(Debug, Clone)]
pub struct RandomIdentity {
    client_id: String,
}

impl RandomIdentity {
    /// Create an identity with a random client id.
    pub fn new() -> Self {
        Self {
            client_id: random_hex(8),
        }
    }

    /// Create an identity with a chosen client id.
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

impl Default for RandomIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for RandomIdentity {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn next_ephemeral_id(&self) -> String {
        random_hex(8)
    }
}

/// Deterministic identifiers: a fixed client id and a counter.
///
/// Ephemeral ids are `"{prefix}-{n}"` with `n` starting at 1.
#[derive(Debug)]
pub struct FixedIdentity {
    client_id: String,
    prefix: String,
    counter: AtomicU64,
}

impl FixedIdentity {
    /// Ephemeral ids are prefixed with the client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            prefix: client_id.clone(),
            client_id,
            counter: AtomicU64::new(0),
        }
    }

    /// Use a distinct prefix for ephemeral ids.
    pub fn with_prefix(client_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdentityProvider for FixedIdentity {
    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    fn next_ephemeral_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_identity_is_stable() {
        let id = RandomIdentity::new();
        assert_eq!(id.client_id(), id.client_id());
        assert_eq!(id.client_id().len(), 16);
    }

    #[test]
    fn test_random_ephemeral_ids_differ() {
        let id = RandomIdentity::new();
        let a = id.next_ephemeral_id();
        let b = id.next_ephemeral_id();
        assert_ne!(a, b);
        assert_ne!(a, id.client_id());
    }

    #[test]
    fn test_fixed_identity_counts() {
        let id = FixedIdentity::new("alice");
        assert_eq!(id.client_id(), "alice");
        assert_eq!(id.next_ephemeral_id(), "alice-1");
        assert_eq!(id.next_ephemeral_id(), "alice-2");

        let other = FixedIdentity::with_prefix("bob", "b");
        assert_eq!(other.next_ephemeral_id(), "b-1");
    }
}
