//! Completion tokens for asynchronous launches

use crate::error::{BackendError, Result};
use crate::kernel::KernelOutput;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct TokenState {
    kernel: &'static str,
    result: Mutex<Option<Result<KernelOutput>>>,
    done: Condvar,
    cancelled: AtomicBool,
}

/// Handle to a submitted launch.
///
/// `wait` blocks until the launch finishes and may be called any number of
/// times; every call returns the same result. `cancel` is best-effort: work
/// that has already started may still complete and commit.
#[derive(Clone)]
pub struct CompletionToken {
    state: Arc<TokenState>,
}

/// Producer side of a [`CompletionToken`], owned by the worker.
pub struct Completer {
    state: Arc<TokenState>,
}

impl CompletionToken {
    /// A token and the completer that will resolve it.
    pub fn pending(kernel: &'static str) -> (Self, Completer) {
        let state = Arc::new(TokenState {
            kernel,
            result: Mutex::new(None),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            Completer { state },
        )
    }

    /// A token that is already resolved (synchronous backends).
    pub fn completed(kernel: &'static str, result: Result<KernelOutput>) -> Self {
        let (token, completer) = Self::pending(kernel);
        completer.complete(result);
        token
    }

    pub fn kernel(&self) -> &'static str {
        self.state.kernel
    }

    pub fn is_complete(&self) -> bool {
        self.state.result.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Returns `false` if the launch had already
    /// finished, in which case its result stands.
    pub fn cancel(&self) -> bool {
        let guard = self.state.result.lock();
        if guard.is_some() {
            return false;
        }
        self.state.cancelled.store(true, Ordering::Release);
        tracing::debug!(kernel = self.state.kernel, "launch_cancel_requested");
        true
    }

    /// Block until the launch resolves.
    pub fn wait(&self) -> Result<KernelOutput> {
        let mut guard = self.state.result.lock();
        while guard.is_none() {
            self.state.done.wait(&mut guard);
        }
        guard.clone().unwrap_or(Err(BackendError::Cancelled {
            kernel: self.state.kernel,
        }))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<KernelOutput>> {
        let mut guard = self.state.result.lock();
        if guard.is_none() {
            let _ = self.state.done.wait_while_for(&mut guard, |result| result.is_none(), timeout);
        }
        guard.clone()
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("kernel", &self.state.kernel)
            .field("complete", &self.is_complete())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Completer {
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolve the token. Only the first call has an effect.
    pub fn complete(self, result: Result<KernelOutput>) {
        let mut guard = self.state.result.lock();
        if guard.is_none() {
            *guard = Some(result);
        }
        drop(guard);
        self.state.done.notify_all();
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        // A worker that unwinds without completing must not strand waiters.
        let mut guard = self.state.result.lock();
        if guard.is_none() {
            *guard = Some(Err(BackendError::Cancelled {
                kernel: self.state.kernel,
            }));
            drop(guard);
            self.state.done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completed_token_waits_immediately() {
        let token = CompletionToken::completed("dot", Ok(KernelOutput::Scalar(2.5)));
        assert!(token.is_complete());
        assert_eq!(token.wait(), Ok(KernelOutput::Scalar(2.5)));
        // idempotent
        assert_eq!(token.wait(), Ok(KernelOutput::Scalar(2.5)));
        assert!(!token.cancel());
    }

    #[test]
    fn wait_blocks_until_completer_resolves() {
        let (token, completer) = CompletionToken::pending("axpy");
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(Ok(KernelOutput::Updated));
        });
        assert_eq!(token.wait(), Ok(KernelOutput::Updated));
        worker.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_on_pending_launch() {
        let (token, _completer) = CompletionToken::pending("matvec");
        assert!(token.wait_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn cancel_is_visible_to_completer() {
        let (token, completer) = CompletionToken::pending("axpy");
        assert!(token.cancel());
        assert!(completer.is_cancelled());
        completer.complete(Err(BackendError::Cancelled { kernel: "axpy" }));
        assert_eq!(token.wait(), Err(BackendError::Cancelled { kernel: "axpy" }));
    }

    #[test]
    fn dropped_completer_resolves_as_cancelled() {
        let (token, completer) = CompletionToken::pending("dot");
        drop(completer);
        assert!(matches!(token.wait(), Err(BackendError::Cancelled { .. })));
    }
}
