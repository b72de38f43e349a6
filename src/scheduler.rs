//! Scheduling seam for background sync.
//!
//! The translog never owns threads directly; the embedding engine hands it a
//! [`TaskScheduler`]. The thread-backed implementation here is suitable for
//! standalone use and for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

/// A one-shot task, boxed so it can cross the scheduling seam.
pub type Task = Box<dyn FnOnce() + Send>;

/// Deferred and immediate task execution, provided by the embedding engine.
pub trait TaskScheduler: Send + Sync {
    /// Runs `task` once after `delay`, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle;

    /// Runs `task` as soon as possible on an executor suitable for blocking
    /// flush work.
    fn execute(&self, task: Task);
}

/// Cancellation handle for a scheduled task. Cancelling does not interrupt
/// a task that has already started.
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Scheduler that backs every task with a dedicated thread.
#[derive(Debug, Default)]
pub struct ThreadScheduler;

impl TaskScheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let spawned = thread::Builder::new()
            .name("translog-sync".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if !flag.load(Ordering::SeqCst) {
                    task();
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn scheduled translog task: {e}");
        }
        ScheduledHandle::new(cancelled)
    }

    fn execute(&self, task: Task) {
        let spawned = thread::Builder::new()
            .name("translog-flush".to_string())
            .spawn(task);
        if let Err(e) = spawned {
            warn!("failed to spawn translog flush task: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(ran: &AtomicUsize, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if ran.load(Ordering::SeqCst) == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_schedule_runs_after_delay() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let scheduler = ThreadScheduler;
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(wait_for(&ran, 1));
    }

    #[test]
    fn test_cancel_prevents_execution() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let scheduler = ThreadScheduler;
        let handle = scheduler.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_execute_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let scheduler = ThreadScheduler;
        scheduler.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(wait_for(&ran, 1));
    }
}
