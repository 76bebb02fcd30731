//! Cancellation tokens for callbacks that cross threads
//!
//! A component hands a clone of its token to every callback it posts to
//! another runner. Cancelling the token turns those callbacks into no-ops.
//! `cancel_and_wait` additionally blocks until any callback currently
//! running under the token has returned, so nothing fires after it.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    gate: RwLock<()>,
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Mark cancelled without waiting for running callbacks
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Mark cancelled and wait for callbacks running under this token.
    ///
    /// Must not be called from inside a callback guarded by the same token.
    pub fn cancel_and_wait(&self) {
        self.cancel();
        drop(self.state.gate.write());
    }

    /// Run `f` unless cancelled
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.state.gate.read_recursive();
        if self.is_cancelled() {
            return None;
        }
        Some(f())
    }

    /// Wrap `f` so that it becomes a no-op once the token is cancelled
    pub fn bind<F>(&self, f: F) -> impl FnOnce() + Send + 'static
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.clone();
        move || {
            token.run(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn bound_callbacks_skip_after_cancel() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let first = token.bind(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = hits.clone();
        let second = token.bind(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        first();
        token.cancel();
        second();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_and_wait_blocks_on_running_callback() {
        let token = CancellationToken::new();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let finished = Arc::new(AtomicBool::new(false));

        let worker_token = token.clone();
        let worker_finished = finished.clone();
        let worker = std::thread::spawn(move || {
            worker_token.run(|| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                worker_finished.store(true, Ordering::SeqCst);
            });
        });

        entered_rx.recv().unwrap();
        token.cancel_and_wait();
        assert!(finished.load(Ordering::SeqCst));
        assert!(token.run(|| ()).is_none());
        worker.join().unwrap();
    }
}
