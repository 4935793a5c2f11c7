use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RdmaError, Result};

/// A cloneable flag that blocking waits observe.
///
/// The process entry point owns one and hands clones to the session; a
/// signal handler (or a test) triggers it and every wait in the engine
/// returns [`RdmaError::Cancelled`] so that the owning scope can unwind and
/// tear its resources down.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(RdmaError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `total`, waking early (with `Cancelled`) on shutdown.
    pub fn sleep(&self, total: Duration) -> Result<()> {
        const SLICE: Duration = Duration::from_millis(20);
        let deadline = Instant::now() + total;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(signal.check().is_ok());
        clone.trigger();
        assert!(signal.is_triggered());
        assert!(matches!(signal.check(), Err(RdmaError::Cancelled)));
    }

    #[test]
    fn test_sleep_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });
        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(30)).is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
        t.join().unwrap();
    }

    #[test]
    fn test_sleep_completes() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(30)).is_ok());
    }
}
