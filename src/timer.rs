use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// One-shot restartable timer.
///
/// The handler is delivered from a spawned task; `clear` cancels the pending
/// firing so the handler is not invoked afterward. Handles are cheap to clone
/// and share the same pending state.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    duration: Duration,
    handler: Arc<dyn Fn() + Send + Sync>,
    active: Mutex<Option<ActiveTimer>>,
}

struct ActiveTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveTimer {
    fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl Timer {
    pub fn new(duration: Duration, handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                duration,
                handler: Arc::new(handler),
                active: Mutex::new(None),
            }),
        }
    }

    /// Schedules the handler after the default duration, cancelling any
    /// pending firing first.
    pub fn start(&self) {
        self.start_with(self.inner.duration);
    }

    /// Schedules the handler after the given duration, cancelling any pending
    /// firing first.
    pub fn start_with(&self, duration: Duration) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handler = self.inner.handler.clone();
        let task = tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = sleep(duration) => handler(),
            }
        });
        let previous = self.inner.active.lock().replace(ActiveTimer { cancel, task });
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancels and schedules anew.
    pub fn restart(&self) {
        self.start();
    }

    /// Cancels the pending firing, if any.
    pub fn clear(&self) {
        if let Some(active) = self.inner.active.lock().take() {
            active.cancel();
        }
    }

    /// Whether the timer is armed and has not fired yet.
    pub fn has_pending(&self) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| !active.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel();
        }
    }
}

/// Resolution of a [`PromiseTimer`] future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The full duration elapsed.
    Fired,
    /// `clear` was called before the duration elapsed.
    Cleared,
}

/// Timer whose firing is consumed as a future rather than a callback.
///
/// `start` returns a future that resolves with [`TimerOutcome::Fired`] after
/// the configured duration, or [`TimerOutcome::Cleared`] once `clear` is
/// called. A consumer racing a real completion against this future can never
/// mistake cancellation for a timeout.
#[derive(Clone)]
pub struct PromiseTimer {
    duration: Duration,
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl PromiseTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Arms the timer. An earlier outstanding future resolves as `Cleared`.
    pub fn start(&self) -> impl Future<Output = TimerOutcome> + Send + 'static {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let duration = self.duration;
        if let Some(previous) = self.active.lock().replace(cancel) {
            previous.cancel();
        }
        async move {
            select! {
                _ = token.cancelled() => TimerOutcome::Cleared,
                _ = sleep(duration) => TimerOutcome::Fired,
            }
        }
    }

    /// Resolves any outstanding future as `Cleared`.
    pub fn clear(&self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_duration() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = Timer::new(Duration::from_millis(50), move || {
            counter.fetch_add(1, SeqCst);
        });
        timer.start();
        sleep(Duration::from_millis(49)).await;
        assert_eq!(fired.load(SeqCst), 0);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(SeqCst), 1);

        // One-shot: no second firing.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = Timer::new(Duration::from_millis(50), move || {
            counter.fetch_add(1, SeqCst);
        });
        timer.start();
        sleep(Duration::from_millis(20)).await;
        timer.clear();
        assert!(!timer.has_pending());
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_reschedules_from_now() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = Timer::new(Duration::from_millis(50), move || {
            counter.fetch_add(1, SeqCst);
        });
        timer.start();
        sleep(Duration::from_millis(30)).await;
        timer.restart();
        sleep(Duration::from_millis(30)).await;
        // 60ms since the original start, 30ms since restart.
        assert_eq!(fired.load(SeqCst), 0);
        sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn promise_timer_fires() {
        let timer = PromiseTimer::new(Duration::from_millis(100));
        let outcome = timer.start().await;
        assert_eq!(outcome, TimerOutcome::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn promise_timer_clear_is_distinguishable() {
        let timer = PromiseTimer::new(Duration::from_secs(60));
        let pending = timer.start();
        let waiter = tokio::spawn(pending);
        sleep(Duration::from_millis(10)).await;
        timer.clear();
        assert_eq!(waiter.await.unwrap(), TimerOutcome::Cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn promise_timer_restart_clears_previous_future() {
        let timer = PromiseTimer::new(Duration::from_millis(100));
        let first = tokio::spawn(timer.start());
        sleep(Duration::from_millis(10)).await;
        let second = timer.start();
        assert_eq!(first.await.unwrap(), TimerOutcome::Cleared);
        assert_eq!(second.await, TimerOutcome::Fired);
    }
}
