use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::warn;

/// Cancellable one-shot timer. Re-arming or cancelling bumps the
/// generation, so a callback that already woke up can tell it is stale.
#[derive(Debug, Default)]
pub struct UndoTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl UndoTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Runs `fire(generation)` once `delay` has elapsed, replacing any
    /// pending callback. Outside a tokio runtime nothing is scheduled.
    pub fn arm<F>(&mut self, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let deadline = Instant::now() + delay;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.handle = Some(runtime.spawn(async move {
                    sleep_until(deadline).await;
                    fire(generation);
                }));
            }
            Err(_) => warn!("no async runtime, undo timer not scheduled"),
        }
        generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && self.generation == generation
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Called from inside the callback; forgets the handle without aborting
    /// the running task.
    pub fn fired(&mut self, generation: u64) -> bool {
        if self.is_current(generation) {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for UndoTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Per-field undo bookkeeping for the field editor.
#[derive(Debug, Default)]
pub struct UndoEntry {
    /// Value captured when the current edit session started.
    pub original_value: Option<String>,
    pub show_undo: bool,
    pub timer: UndoTimer,
}

impl UndoEntry {
    pub fn clear(&mut self) {
        self.original_value = None;
        self.show_undo = false;
        self.timer.cancel();
    }
}

#[derive(Debug)]
struct UndoableInner<T> {
    current: T,
    previous: Option<T>,
    timer: UndoTimer,
}

/// A value whose last change can be reverted for a short window, e.g. a tag
/// toggle.
#[derive(Debug, Clone)]
pub struct UndoableState<T> {
    inner: Arc<Mutex<UndoableInner<T>>>,
    window: Duration,
}

impl<T> UndoableState<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(initial: T, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(UndoableInner {
                current: initial,
                previous: None,
                timer: UndoTimer::new(),
            })),
            window,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UndoableInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> T {
        self.lock().current.clone()
    }

    pub fn can_undo(&self) -> bool {
        self.lock().previous.is_some()
    }

    pub fn set(&self, value: T) {
        let weak: Weak<Mutex<UndoableInner<T>>> = Arc::downgrade(&self.inner);
        let mut inner = self.lock();
        let old = std::mem::replace(&mut inner.current, value);
        inner.previous = Some(old);
        inner.timer.arm(self.window, move |generation| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.timer.fired(generation) {
                inner.previous = None;
            }
        });
    }

    /// Reverts the last `set`. Returns the restored value.
    pub fn undo(&self) -> Option<T> {
        let mut inner = self.lock();
        let previous = inner.previous.take()?;
        inner.timer.cancel();
        inner.current = previous.clone();
        Some(previous)
    }

    /// Closes the undo window early.
    pub fn commit(&self) {
        let mut inner = self.lock();
        inner.previous = None;
        inner.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timer = UndoTimer::new();
        let h = hits.clone();
        timer.arm(Duration::from_secs(5), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_pending_callback() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timer = UndoTimer::new();
        for _ in 0..3 {
            let h = hits.clone();
            timer.arm(Duration::from_secs(1), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_drop_abort_the_task() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut timer = UndoTimer::new();
        let h = hits.clone();
        let generation = timer.arm(Duration::from_secs(1), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_current(generation));
        timer.cancel();
        assert!(!timer.is_current(generation));

        let h = hits.clone();
        let mut dropped = UndoTimer::new();
        dropped.arm(Duration::from_secs(1), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(dropped);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn arm_without_runtime_is_a_no_op() {
        let mut timer = UndoTimer::new();
        timer.arm(Duration::from_secs(1), |_| {});
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn undoable_state_reverts_within_window() {
        let state = UndoableState::new(false, Duration::from_secs(5));
        state.set(true);
        assert!(state.get());
        assert!(state.can_undo());

        assert_eq!(state.undo(), Some(false));
        assert!(!state.get());
        assert!(!state.can_undo());
        assert_eq!(state.undo(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn undoable_state_window_expires() {
        let state = UndoableState::new(1, Duration::from_secs(5));
        state.set(2);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!state.can_undo());
        assert_eq!(state.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn undoable_state_commit_closes_window() {
        let state = UndoableState::new("a".to_string(), Duration::from_secs(5));
        state.set("b".to_string());
        state.commit();
        assert_eq!(state.undo(), None);
        assert_eq!(state.get(), "b");
    }
}
