//! Run context and callback traits
//!
//! These let the engine report progress, propagate cancellation and hand
//! providers a logging sink without depending on any UI or signal handling.

use crate::error::ProviderError;
use crate::state::StateStore;
use crate::types::{ResourceOutcome, RunKind, RunResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity at which blocking waits re-check the cancellation flag
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Cancellation signal shared by the operator-interrupt handler, the
/// scheduler and every in-flight provider call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if the token was cancelled before or during the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_POLL.min(deadline - now));
        }
    }
}

/// Logging sink bound to one resource.
///
/// Records go through the `log` facade under the `converge::provider` target,
/// prefixed with the resource ID.
#[derive(Debug, Clone)]
pub struct ProviderLogger {
    resource_id: String,
}

impl ProviderLogger {
    pub const TARGET: &'static str = "converge::provider";

    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        log::debug!(target: Self::TARGET, "[{}] {}", self.resource_id, msg);
    }

    pub fn info(&self, msg: impl fmt::Display) {
        log::info!(target: Self::TARGET, "[{}] {}", self.resource_id, msg);
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        log::warn!(target: Self::TARGET, "[{}] {}", self.resource_id, msg);
    }

    pub fn error(&self, msg: impl fmt::Display) {
        log::error!(target: Self::TARGET, "[{}] {}", self.resource_id, msg);
    }
}

/// Context passed to provider lifecycle calls
pub struct ProviderContext<'a> {
    cancel: &'a CancelToken,
    store: &'a StateStore,
}

impl<'a> ProviderContext<'a> {
    pub fn new(cancel: &'a CancelToken, store: &'a StateStore) -> Self {
        Self { cancel, store }
    }

    /// Outputs of an already-applied resource, read from the state store
    pub fn upstream_outputs(&self, id: &str) -> Option<Value> {
        self.store.find_by_id(id).map(|entry| entry.outputs)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return [`ProviderError::Cancelled`] if the run has been interrupted
    pub fn check_cancelled(&self) -> Result<(), ProviderError> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancellable sleep for polling loops
    pub fn sleep(&self, duration: Duration) -> Result<(), ProviderError> {
        if self.cancel.sleep(duration) {
            Ok(())
        } else {
            Err(ProviderError::Cancelled)
        }
    }
}

/// Progress callback for runs
///
/// Called from worker threads, hence `Sync` and `&self`.
pub trait ProgressCallback: Sync {
    /// Called once before the first level
    fn on_run_start(&self, kind: RunKind, total: usize);

    /// Called before a level is scheduled (0-indexed)
    fn on_level_start(&self, index: usize, count: usize);

    /// Called when a worker starts a resource
    fn on_resource_start(&self, id: &str);

    /// Called when a resource finishes, successfully or not
    fn on_resource_complete(&self, outcome: &ResourceOutcome);

    /// Called for a resource skipped because `by` failed
    fn on_resource_blocked(&self, id: &str, by: &str);

    /// Called once after the run
    fn on_run_complete(&self, result: &RunResult);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&self, _kind: RunKind, _total: usize) {}
    fn on_level_start(&self, _index: usize, _count: usize) {}
    fn on_resource_start(&self, _id: &str) {}
    fn on_resource_complete(&self, _outcome: &ResourceOutcome) {}
    fn on_resource_blocked(&self, _id: &str, _by: &str) {}
    fn on_run_complete(&self, _result: &RunResult) {}
}
