use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Cooperative shutdown signal shared between the runtime and its worker
/// threads. Once requested it stays set; waiters are woken immediately.
pub struct Shutdown {
    requested: Mutex<bool>,
    wakeup: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn request(&self) {
        let mut requested = self.requested.lock().unwrap();
        *requested = true;
        self.wakeup.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.requested.lock().unwrap()
    }

    /// Block until the signal is requested or `timeout` elapses. Returns
    /// whether the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let requested = self.requested.lock().unwrap();
        if *requested {
            return true;
        }
        let (requested, _) = self.wakeup.wait_timeout(requested, timeout).unwrap();
        *requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn request_wakes_waiter_early() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let set = waiter.wait_timeout(Duration::from_secs(10));
            (set, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.request();
        let (set, elapsed) = handle.join().unwrap();
        assert!(set);
        assert!(elapsed < Duration::from_secs(2));
        assert!(shutdown.is_set());
    }

    #[test]
    fn timeout_without_request_reports_unset() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(10)));
        assert!(!shutdown.is_set());
    }
}
