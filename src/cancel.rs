//! Stop signal for ingest runs and search walks
//!
//! `IngestPipeline::run` races each read from its `EventSource` against
//! [`CancellationToken::cancelled`], so a source that is idle (stdin with
//! nobody typing) still stops promptly. `QueryService` polls the token
//! between search pages instead. The MCP server cancels its token on
//! shutdown; the CLI cancels on Ctrl-C.
//!
//! Cancelling never rolls anything back: events already stored stay stored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Signal {
    fired: AtomicBool,
    wake: Notify,
}

/// Shared stop flag; clones observe the same signal
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    signal: Arc<Signal>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.fired.load(Ordering::Acquire)
    }

    /// Fire the signal, waking every task parked in [`cancelled`](Self::cancelled)
    pub fn cancel(&self) {
        self.signal.fired.store(true, Ordering::Release);
        self.signal.wake.notify_waiters();
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let notified = self.signal.wake.notified();
        tokio::pin!(notified);
        // Register before checking so a cancel in between is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
