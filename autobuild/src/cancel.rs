//! Cooperative cancellation for the engine's polling loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Shared flag checked by every sleep-then-recheck loop.
///
/// Cancelling never interrupts an in-flight agent `execute()`; it only stops
/// loops at their next suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `interval` in short slices, returning early on cancellation.
    ///
    /// Returns `false` if the token was cancelled before the interval elapsed.
    pub fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let slice = Duration::from_millis(25).min(interval);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn live_token_sleeps_full_interval() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }
}
