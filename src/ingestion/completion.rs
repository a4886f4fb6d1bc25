//! Completion signals wiring producer callbacks to drainer persistence.
//!
//! A [`CompletionSignal`] is the minimal future-like primitive the engine
//! needs: complete once with success or failure, support cancellation, allow
//! any number of cloned handles to wait with a timeout, and answer
//! `is_done()` cheaply. Per-partition consumption state holds the signal of
//! the last leader-produced record; demotion and topic switches block on it
//! so the new subscription starts from a fully persisted offset.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Terminal state of a completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    /// The tracked operation persisted successfully.
    Completed,
    /// The tracked operation failed.
    Failed(String),
    /// A waiter gave up and cancelled the signal.
    Cancelled,
}

impl SignalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SignalResult::Completed)
    }
}

#[derive(Debug)]
enum SignalState {
    Pending,
    Done(SignalResult),
}

#[derive(Debug)]
struct SignalInner {
    state: Mutex<SignalState>,
    notify: Notify,
}

/// Clonable one-shot completion handle.
///
/// All clones observe the same terminal state; the first `complete_*` or
/// `cancel` wins and later ones are no-ops.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState::Pending),
                notify: Notify::new(),
            }),
        }
    }

    /// A signal that is already completed successfully.
    pub fn completed() -> Self {
        let signal = Self::new();
        signal.complete_ok();
        signal
    }

    fn finish(&self, result: SignalResult) {
        let mut state = self.inner.state.lock().expect("signal lock poisoned");
        if matches!(*state, SignalState::Pending) {
            *state = SignalState::Done(result);
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    /// Mark the tracked operation as persisted.
    pub fn complete_ok(&self) {
        self.finish(SignalResult::Completed);
    }

    /// Mark the tracked operation as failed.
    pub fn complete_err(&self, message: impl Into<String>) {
        self.finish(SignalResult::Failed(message.into()));
    }

    /// Cancel the signal; pending waiters observe [`SignalResult::Cancelled`].
    pub fn cancel(&self) {
        self.finish(SignalResult::Cancelled);
    }

    /// True once the signal reached any terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(
            *self.inner.state.lock().expect("signal lock poisoned"),
            SignalState::Pending
        )
    }

    fn poll_state(&self) -> Option<SignalResult> {
        match &*self.inner.state.lock().expect("signal lock poisoned") {
            SignalState::Pending => None,
            SignalState::Done(result) => Some(result.clone()),
        }
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> SignalResult {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(result) = self.poll_state() {
                return result;
            }
            notified.await;
        }
    }

    /// Wait for the terminal state with an upper bound.
    ///
    /// Returns `None` when the timeout elapses; the signal itself is left
    /// untouched so the caller decides whether to cancel.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<SignalResult> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_before_wait() {
        let signal = CompletionSignal::new();
        signal.complete_ok();
        assert!(signal.is_done());
        assert_eq!(signal.wait().await, SignalResult::Completed);
    }

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let signal = CompletionSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        signal.complete_err("producer send failed");
        let result = handle.await.expect("waiter task");
        assert_eq!(
            result,
            SignalResult::Failed("producer send failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_first_terminal_state_wins() {
        let signal = CompletionSignal::new();
        signal.complete_ok();
        signal.cancel();
        signal.complete_err("too late");
        assert_eq!(signal.wait().await, SignalResult::Completed);
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses_without_cancel() {
        let signal = CompletionSignal::new();
        let result = signal.wait_timeout(Duration::from_millis(10)).await;
        assert!(result.is_none());
        // The timeout must not consume the signal.
        assert!(!signal.is_done());
        signal.complete_ok();
        assert_eq!(signal.wait().await, SignalResult::Completed);
    }

    #[tokio::test]
    async fn test_cancel_observed_by_all_clones() {
        let signal = CompletionSignal::new();
        let observer = signal.clone();
        signal.cancel();
        assert_eq!(observer.wait().await, SignalResult::Cancelled);
        assert!(!observer.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_already_completed_constructor() {
        let signal = CompletionSignal::completed();
        assert!(signal.is_done());
        assert!(signal.wait().await.is_success());
    }
}
