//! Shared-timer deadline scheduling
//!
//! One driver task services every armed deadline for a channel, holding at
//! most a single outstanding `sleep_until` re-armed to the nearest upcoming
//! deadline. This keeps timer overhead flat under high concurrent-request
//! volume instead of allocating one timer per in-flight request.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use core::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// Callback invoked when a deadline fires
pub type DeadlineCallback = Box<dyn FnOnce() + Send + 'static>;

// ----------------------------------------------------------------------------
// Scheduler State
// ----------------------------------------------------------------------------

struct Entry {
    deadline: Instant,
    callback: DeadlineCallback,
}

struct SchedulerState {
    entries: HashMap<String, Entry>,
    destroyed: bool,
}

// ----------------------------------------------------------------------------
// Timeout Scheduler
// ----------------------------------------------------------------------------

/// Id-keyed deadline map serviced by a single shared timer.
///
/// Must be created inside a tokio runtime; the driver task lives until
/// [`TimeoutScheduler::destroy`] or drop.
pub struct TimeoutScheduler {
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
    driver: JoinHandle<()>,
}

impl TimeoutScheduler {
    /// Create the scheduler and spawn its driver task
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(SchedulerState {
            entries: HashMap::new(),
            destroyed: false,
        }));
        let notify = Arc::new(Notify::new());
        let driver = tokio::spawn(drive(Arc::clone(&state), Arc::clone(&notify)));
        Self {
            state,
            notify,
            driver,
        }
    }

    /// Arm a deadline for `id`. An existing deadline under the same id is
    /// replaced.
    pub fn add(&self, id: impl Into<String>, duration: Duration, callback: impl FnOnce() + Send + 'static) {
        let id = id.into();
        let deadline = Instant::now() + duration;
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            if state.destroyed {
                warn!(id = %id, "deadline armed on destroyed scheduler, dropping");
                return;
            }
            state.entries.insert(
                id,
                Entry {
                    deadline,
                    callback: Box::new(callback),
                },
            );
        }
        // The driver recomputes the nearest deadline on every wake, so a
        // plain notify covers both the earlier-deadline and idle cases.
        self.notify.notify_one();
    }

    /// Disarm a deadline. Pure map deletion; a removed id simply never fires.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.entries.remove(id).is_some()
    }

    /// Whether a deadline is armed for `id`
    pub fn has(&self, id: &str) -> bool {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.entries.contains_key(id)
    }

    /// Number of armed deadlines
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disarm every deadline without firing it
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.entries.clear();
    }

    /// Clear all state and stop the driver. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.destroyed = true;
            state.entries.clear();
        }
        self.notify.notify_one();
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.destroy();
        self.driver.abort();
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Driver Task
// ----------------------------------------------------------------------------

async fn drive(state: Arc<Mutex<SchedulerState>>, notify: Arc<Notify>) {
    loop {
        let nearest = {
            let state = state.lock().expect("scheduler state poisoned");
            if state.destroyed {
                return;
            }
            state.entries.values().map(|e| e.deadline).min()
        };

        match nearest {
            None => notify.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => fire_elapsed(&state),
                    _ = notify.notified() => {}
                }
            }
        }
    }
}

/// Sweep every entry whose deadline has passed and invoke its callback
fn fire_elapsed(state: &Arc<Mutex<SchedulerState>>) {
    let now = Instant::now();
    let elapsed: Vec<(String, DeadlineCallback)> = {
        let mut state = state.lock().expect("scheduler state poisoned");
        let due: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| state.entries.remove(&id).map(|e| (id, e.callback)))
            .collect()
    };

    for (id, callback) in elapsed {
        // One misbehaving callback must not suppress the rest of the sweep
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            warn!(id = %id, "deadline callback panicked");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let reader = {
            let count = Arc::clone(&count);
            move || count.load(Ordering::SeqCst)
        };
        (count, reader)
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once() {
        let scheduler = TimeoutScheduler::new();
        let (count, read) = counter();

        scheduler.add("a", Duration::from_millis(100), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.has("a"));
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(read(), 1);
        assert!(!scheduler.has("a"));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_deadline_never_fires() {
        let scheduler = TimeoutScheduler::new();
        let (count, read) = counter();

        scheduler.add("a", Duration::from_millis(100), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.remove("a"));
        assert!(!scheduler.remove("a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(read(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_rearms_shared_timer() {
        let scheduler = TimeoutScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        scheduler.add("slow", Duration::from_millis(500), move || {
            o.lock().unwrap().push("slow");
        });
        // Armed after `slow` but due before it
        let o = Arc::clone(&order);
        scheduler.add("fast", Duration::from_millis(50), move || {
            o.lock().unwrap().push("fast");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().unwrap(), vec!["fast"]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_fires_all_elapsed_entries() {
        let scheduler = TimeoutScheduler::new();
        let (count, read) = counter();

        for i in 0..5 {
            let count = Arc::clone(&count);
            scheduler.add(format!("id-{i}"), Duration::from_millis(80), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.len(), 5);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(read(), 5);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_same_id_replaces_deadline() {
        let scheduler = TimeoutScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f = Arc::clone(&fired);
        scheduler.add("a", Duration::from_millis(50), move || {
            f.lock().unwrap().push("first");
        });
        let f = Arc::clone(&fired);
        scheduler.add("a", Duration::from_millis(200), move || {
            f.lock().unwrap().push("second");
        });
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_discards_armed_deadlines() {
        let scheduler = TimeoutScheduler::new();
        let (count, read) = counter();

        let c = Arc::clone(&count);
        scheduler.add("a", Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.destroy();
        scheduler.destroy(); // idempotent

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(read(), 0);

        // Arming after destroy is a logged no-op
        scheduler.add("b", Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(read(), 0);
    }
}
