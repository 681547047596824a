use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::Result;

/// Self-rescheduling periodic task
///
/// Each attempt is followed by a fresh delay of one period, whatever the
/// attempt returned. Only [`Heartbeat::stop`] ends the cycle.
#[derive(Default)]
pub struct Heartbeat {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer, replacing any previous schedule
    pub fn start<F, Fut>(&self, period: Duration, mut beat: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match beat().await {
                    Ok(()) => debug!("Heartbeat sent"),
                    Err(e) => warn!("Failed to send heartbeat: {}", e),
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Disarms the timer, returning whether it was armed
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reschedules_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let heartbeat = Heartbeat::new();

        let counter = Arc::clone(&attempts);
        heartbeat.start(Duration::from_secs(10), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n % 2 == 0 {
                    Err(Error::transport("server unreachable"))
                } else {
                    Ok(())
                }
            }
        });
        assert!(heartbeat.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        assert!(heartbeat.stop());
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!heartbeat.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_schedule() {
        let attempts = Arc::new(AtomicU32::new(0));
        let heartbeat = Heartbeat::new();

        for _ in 0..2 {
            let counter = Arc::clone(&attempts);
            heartbeat.start(Duration::from_secs(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            });
        }

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        heartbeat.stop();
    }
}
