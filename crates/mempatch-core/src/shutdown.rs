use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Stop signal with interruptible waits, used to pace the patcher worker.
///
/// Unlike `thread::sleep()`, a wait on this signal returns as soon as the
/// signal is triggered, so stopping the worker never blocks for a full
/// sweep interval.
pub struct ShutdownSignal {
    stopped: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    /// Trigger the signal, waking every waiting thread.
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for `duration` or until the signal triggers. Returns `true` when
    /// interrupted by the trigger.
    pub fn wait(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let guard = match self.mutex.lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        match self
            .condvar
            .wait_timeout_while(guard, duration, |_| !self.is_triggered())
        {
            Ok((_, timeout)) => !timeout.timed_out(),
            Err(_) => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_trigger_interrupts_wait() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
