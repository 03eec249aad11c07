use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned when a sleep was cut short by [`Interrupt::interrupt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation interrupted")]
pub struct Interrupted;

/// Shared cancellation flag that wakes sleeping threads
///
/// Clones share the same flag. Once interrupted it stays interrupted until
/// [`Interrupt::reset`] is called.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every thread sleeping on it
    pub fn interrupt(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    pub fn is_interrupted(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration` unless interrupted first
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        let (flag, condvar) = &*self.inner;
        let mut interrupted = flag.lock();

        while !*interrupted {
            if condvar.wait_until(&mut interrupted, deadline).timed_out() {
                break;
            }
        }

        if *interrupted {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}
