//! Background expiration sweep.
//!
//! A dedicated thread calls [`CacheManager::check_expired`] on a fixed
//! interval until the ticker is shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::manager::CacheManager;

/// Handle to the sweep thread.
pub struct Ticker {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Start sweeping `manager` every `interval`.
    pub fn spawn(manager: Arc<CacheManager>, interval: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let join_handle = thread::Builder::new()
            .name("xixi-expire".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "expiration ticker started");
                while !flag.load(Ordering::Acquire) {
                    manager.check_expired();
                    thread::park_timeout(interval);
                }
                tracing::debug!("expiration ticker stopped");
            })?;

        Ok(Self {
            shutdown,
            join_handle: Some(join_handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.join_handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("expiration ticker panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_ticker_expires_items() {
        let clock = Arc::new(ManualClock::new(1000));
        let manager = Arc::new(CacheManager::builder().clock(clock.clone()).build());

        let item = manager.new_item(0, b"k", b"v", b"", 0, 5).unwrap();
        manager.add(item, 0).unwrap();
        clock.advance(10);

        let ticker = Ticker::spawn(manager.clone(), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.item_count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        ticker.shutdown();

        assert_eq!(manager.item_count(), 0);
    }

    #[test]
    fn test_shutdown_is_prompt() {
        let manager = Arc::new(CacheManager::builder().build());
        let ticker = Ticker::spawn(manager, Duration::from_secs(3600)).unwrap();
        let start = std::time::Instant::now();
        ticker.shutdown();
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
