//! Round-trip latency measurement.
//!
//! At most one ping is in flight. Every caller waiting on it observes the
//! same measurement.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{NetError, Result};

/// One outstanding ping.
#[derive(Debug)]
pub(crate) struct PendingPing {
    nonce: u64,
    started: Instant,
    result: watch::Sender<Option<Duration>>,
}

impl PendingPing {
    pub(crate) fn start(nonce: u64) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            nonce,
            started: Instant::now(),
            result,
        }
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Whether a pong carrying `nonce` answers this ping.
    ///
    /// Servers that do not echo the nonce answer any ping.
    pub(crate) fn matches(&self, nonce: Option<u64>) -> bool {
        nonce.map_or(true, |n| n == self.nonce)
    }

    pub(crate) fn waiter(&self) -> LatencyWaiter {
        LatencyWaiter {
            result: self.result.subscribe(),
        }
    }

    /// Resolve every waiter with the elapsed time.
    pub(crate) fn complete(self) -> Duration {
        let elapsed = self.started.elapsed();
        let _ = self.result.send(Some(elapsed));
        elapsed
    }
}

/// Waits for a [`PendingPing`] to complete.
#[derive(Debug)]
pub(crate) struct LatencyWaiter {
    result: watch::Receiver<Option<Duration>>,
}

impl LatencyWaiter {
    /// Resolves with the measurement, or `Closed` if the ping was abandoned.
    pub(crate) async fn wait(mut self) -> Result<Duration> {
        let value = self
            .result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NetError::Closed)?;
        (*value).ok_or(NetError::Closed)
    }
}
