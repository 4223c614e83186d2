//! Rendezvous primitives for manufacturing race windows.
//!
//! Every wait is bounded. Running out the clock is a
//! [`CoordinationError::Timeout`]: the race was not exercised as designed,
//! so the scenario must fail rather than pass by accident.

use std::time::Duration;

use tidemark_core::{CoherenceResult, CoordinationError};
use tokio::sync::{watch, Barrier};

/// Bound on every latch and barrier wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(2000);

/// One-shot countdown latch.
#[derive(Debug)]
pub struct CountdownLatch {
    name: String,
    count: watch::Sender<usize>,
}

impl CountdownLatch {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        let (count, _) = watch::channel(count);
        Self {
            name: name.into(),
            count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Decrement the count, saturating at zero.
    pub fn count_down(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Wait for the count to reach zero, bounded by [`WAIT_TIMEOUT`].
    pub async fn wait(&self) -> CoherenceResult<()> {
        self.wait_timeout(WAIT_TIMEOUT).await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> CoherenceResult<()> {
        let mut rx = self.count.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .map(|changed| changed.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CoordinationError::Interrupted {
                what: self.name.clone(),
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(CoordinationError::Timeout {
                what: self.name.clone(),
                waited: timeout,
            }
            .into()),
        }
    }
}

/// Wait on `latch` or fail with a coordination timeout.
pub async fn await_or_throw(latch: &CountdownLatch) -> CoherenceResult<()> {
    latch.wait().await
}

/// Cyclic barrier: "every session has loaded" before anyone mutates.
#[derive(Debug)]
pub struct LoadBarrier {
    parties: usize,
    barrier: Barrier,
}

impl LoadBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            barrier: Barrier::new(parties),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub async fn wait(&self) -> CoherenceResult<()> {
        self.wait_timeout(WAIT_TIMEOUT).await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> CoherenceResult<()> {
        tokio::time::timeout(timeout, self.barrier.wait())
            .await
            .map(|_| ())
            .map_err(|_| {
                CoordinationError::Timeout {
                    what: format!("load barrier ({} parties)", self.parties),
                    waited: timeout,
                }
                .into()
            })
    }
}
