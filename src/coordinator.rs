use std::fmt;
use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;

/// Reason a summarizer run ended. Display strings are the canonical wire
/// values reported to telemetry and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Three consecutive attempts failed.
    FailToSummarize,
    /// Another client is the elected summarizer.
    ParentNoLongerSummarizer,
    /// The parent client lost its connection.
    ParentNotConnected,
    /// The parent decided this client must not summarize (e.g. read-only).
    ParentShouldNotSummarize,
    Disposed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::FailToSummarize => "failToSummarize",
            StopReason::ParentNoLongerSummarizer => "parentNoLongerSummarizer",
            StopReason::ParentNotConnected => "parentNotConnected",
            StopReason::ParentShouldNotSummarize => "parentShouldNotSummarize",
            StopReason::Disposed => "disposed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gates the summarizer run on "connected + elected".
///
/// Built over the host's connection signal (the connected client id, `None`
/// while disconnected) plus an internal first-stop-wins reason slot. All
/// handles observe the same run.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    connected: watch::Receiver<Option<String>>,
    stop: watch::Sender<Option<StopReason>>,
}

impl RunCoordinator {
    pub fn new(connected: watch::Receiver<Option<String>>) -> Self {
        let (stop, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner { connected, stop }),
        }
    }

    /// Resolves with the connected client id, or `None` if the run was
    /// stopped (or the connection signal went away) before ever connecting.
    pub async fn wait_start(&self) -> Option<String> {
        let mut connected = self.inner.connected.clone();
        let mut stop = self.inner.stop.subscribe();
        loop {
            if stop.borrow_and_update().is_some() {
                return None;
            }
            if let Some(client_id) = connected.borrow_and_update().clone() {
                return Some(client_id);
            }
            select! {
                changed = connected.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = stop.changed() => {}
            }
        }
    }

    /// Resolves on the first explicit stop, or with `ParentNotConnected` when
    /// the connection is lost.
    pub async fn wait_stopped(&self) -> StopReason {
        let mut connected = self.inner.connected.clone();
        let mut stop = self.inner.stop.subscribe();
        loop {
            if let Some(reason) = *stop.borrow_and_update() {
                return reason;
            }
            if connected.borrow_and_update().is_none() {
                return StopReason::ParentNotConnected;
            }
            select! {
                _ = stop.changed() => {}
                changed = connected.changed() => {
                    if changed.is_err() {
                        return StopReason::ParentNotConnected;
                    }
                }
            }
        }
    }

    /// Requests a stop. The first reason wins; duplicates are ignored.
    pub fn stop(&self, reason: StopReason) {
        let recorded = self.inner.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if recorded {
            tracing::debug!(reason = %reason, "summarizer stop requested");
        } else {
            tracing::trace!(reason = %reason, "duplicate stop request ignored");
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.inner.stop.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn wait_start_resolves_on_connect() {
        let (tx, rx) = watch::channel(None);
        let coordinator = RunCoordinator::new(rx);
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_start().await })
        };
        sleep(Duration::from_millis(10)).await;
        tx.send(Some("client-a".to_string())).unwrap();
        assert_eq!(waiter.await.unwrap(), Some("client-a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_start_bails_on_stop() {
        let (_tx, rx) = watch::channel(None);
        let coordinator = RunCoordinator::new(rx);
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_start().await })
        };
        sleep(Duration::from_millis(10)).await;
        coordinator.stop(StopReason::Disposed);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn first_stop_reason_wins() {
        let (tx, rx) = watch::channel(Some("client-a".to_string()));
        let coordinator = RunCoordinator::new(rx);
        coordinator.stop(StopReason::FailToSummarize);
        coordinator.stop(StopReason::Disposed);
        assert_eq!(coordinator.stop_reason(), Some(StopReason::FailToSummarize));
        assert_eq!(coordinator.wait_stopped().await, StopReason::FailToSummarize);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_stops_the_run() {
        let (tx, rx) = watch::channel(Some("client-a".to_string()));
        let coordinator = RunCoordinator::new(rx);
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_stopped().await })
        };
        sleep(Duration::from_millis(10)).await;
        tx.send(None).unwrap();
        assert_eq!(waiter.await.unwrap(), StopReason::ParentNotConnected);
    }
}
