//! Completion signals a fenced execution waits on.

use parking_lot::{Condvar, Mutex};

/// A one-shot completion signal.
pub trait Fence: Send + Sync {
    /// Block until signaled. `false` when the producer reported failure.
    fn wait(&self) -> bool;
}

/// A fence signaled from another thread.
#[derive(Debug, Default)]
pub struct SyncFence {
    outcome: Mutex<Option<bool>>,
    signaled: Condvar,
}

impl SyncFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// An already-signaled fence.
    pub fn signaled(ok: bool) -> Self {
        Self {
            outcome: Mutex::new(Some(ok)),
            signaled: Condvar::new(),
        }
    }

    /// Signal once. Later calls are ignored.
    pub fn signal(&self, ok: bool) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(ok);
            self.signaled.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.outcome.lock().is_some()
    }
}

impl Fence for SyncFence {
    fn wait(&self) -> bool {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(ok) = *outcome {
                return ok;
            }
            self.signaled.wait(&mut outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_after_signal() {
        let fence = Arc::new(SyncFence::new());
        let waiter = {
            let fence = Arc::clone(&fence);
            thread::spawn(move || fence.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        fence.signal(true);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_first_signal_wins() {
        let fence = SyncFence::new();
        fence.signal(false);
        fence.signal(true);
        assert!(fence.is_signaled());
        assert!(!fence.wait());
        assert!(SyncFence::signaled(true).wait());
    }
}
