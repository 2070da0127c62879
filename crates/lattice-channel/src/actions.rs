//! RPC call correlation.
//!
//! Every outbound action gets a call id from [`CallIdGenerator`]; the
//! resolve/reject side of the call lives in [`PendingActions`] until the
//! matching response frame arrives. Responses are matched strictly by id;
//! concurrent in-flight calls are independent.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors an action call can resolve to.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ActionError {
    /// The server answered with an error payload.
    #[error("action rejected: {0}")]
    Remote(Value),

    /// The channel closed before the response arrived, or the call was
    /// never sent because the socket was not ready.
    #[error("channel closed before the action response arrived")]
    ChannelClosed,
}

/// Monotonically increasing, time-seeded call ids.
///
/// Seeded from the wall clock in milliseconds with an in-process counter so
/// ids stay unique within a process even under bursts.
#[derive(Debug, Default)]
pub struct CallIdGenerator {
    last: Mutex<u64>,
}

impl CallIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call id, strictly greater than every id issued before.
    pub fn next(&self) -> u64 {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock();
        let candidate = now_ms.saturating_mul(1_000);
        *last = candidate.max(*last + 1);
        *last
    }
}

type Responder = oneshot::Sender<Result<Value, ActionError>>;

/// Table of in-flight calls keyed by call id.
#[derive(Debug, Default)]
pub struct PendingActions {
    calls: Mutex<HashMap<u64, Responder>>,
}

impl PendingActions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return the receiver its response resolves.
    pub fn register(&self, call_id: u64) -> oneshot::Receiver<Result<Value, ActionError>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.calls.lock().insert(call_id, tx);
        rx
    }

    /// Resolve a call by id. Returns `false` when no call matches, leaving
    /// the table untouched.
    pub fn resolve(&self, call_id: u64, outcome: Result<Value, ActionError>) -> bool {
        match self.calls.lock().remove(&call_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every in-flight call; used on terminal closure.
    pub fn drain(&self) {
        let calls = std::mem::take(&mut *self.calls.lock());
        for (_, tx) in calls {
            let _ = tx.send(Err(ActionError::ChannelClosed));
        }
    }

    /// Number of in-flight calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether no calls are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}
