//! Interruptible suspension for the acquisition worker.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared stop flag that can also cut a pending sleep short.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake any sleeper.
    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        let mut stopped = flag.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the signal was
    /// (or already had been) raised.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut stopped = flag.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            stopped = match wake.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
