//! Run-wide cancellation.
//!
//! A `CancellationToken` is cloned into every subject pipeline and every tool
//! invocation. Pipelines poll it between stages; the process runner awaits
//! [`CancellationToken::cancelled`] alongside the child so a long-running tool
//! is killed as soon as the run is cancelled.

use std::sync::Arc;
use tokio::sync::watch;

/// A cancellation token shared by everything taking part in one run.
///
/// # Example
///
/// ```
/// use bidsonym_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let for_signal_handler = token.clone();
///
/// for_signal_handler.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
    /// States of the tokens this one was derived from.
    parents: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
            parents: Vec::new(),
        }
    }

    /// A token that is cancelled together with `self`, but whose own
    /// cancellation does not propagate back.
    pub fn child_token(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(self.state.clone());
        Self {
            parents,
            ..Self::new()
        }
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow() || self.parents.iter().any(|p| *p.borrow())
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let waits: Vec<_> = std::iter::once(&self.state)
            .chain(&self.parents)
            .map(|state| {
                let mut rx = state.subscribe();
                // The sender outlives this future, so `wait_for` only errors
                // if it is dropped, which cannot happen while we hold it.
                Box::pin(async move {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect();
        futures::future::select_all(waits).await;
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Run was cancelled")
    }
}

impl std::error::Error for CancelledError {}
