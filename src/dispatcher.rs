//! Bounded worker pool enforcing at-most-one-action-per-issue and
//! backpressure-drop semantics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct InFlight {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    DroppedAlreadyInFlight,
    DroppedBackpressure,
}

impl Dispatcher {
    pub fn new(max_concurrent_workflows: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_workflows)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_in_flight(&self, issue_key: &str) -> bool {
        self.in_flight.lock().await.contains_key(issue_key)
    }

    /// Submit an action for `issue_key`. Dropped (not queued) if an action
    /// for the same issue is already running, or if the worker pool is
    /// saturated.
    pub async fn submit<F, Fut>(&self, issue_key: String, make_action: F) -> SubmitOutcome
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.in_flight.lock().await;
        if guard.contains_key(&issue_key) {
            warn!(issue = %issue_key, "action dropped: already in flight");
            return SubmitOutcome::DroppedAlreadyInFlight;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(issue = %issue_key, "action dropped: dispatcher saturated");
                return SubmitOutcome::DroppedBackpressure;
            }
        };

        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let in_flight = self.in_flight.clone();
        let key_for_task = issue_key.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            make_action(cancel_for_task).await;
            in_flight.lock().await.remove(&key_for_task);
        });

        guard.insert(issue_key.clone(), InFlight { cancel, handle });
        info!(issue = %issue_key, "action started");
        SubmitOutcome::Started
    }

    /// Signal cancellation for `issue_key`'s in-flight action (used by
    /// `ResetAction`) and wait for it to finish.
    pub async fn cancel_and_wait(&self, issue_key: &str) {
        let entry = self.in_flight.lock().await.remove(issue_key);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = entry.handle.await;
        }
    }

    /// Cancel every in-flight action and wait up to `grace` for them to
    /// finish; anything still running after that is aborted.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<InFlight> = {
            let mut guard = self.in_flight.lock().await;
            guard.drain().map(|(_, v)| v).collect()
        };
        for entry in &entries {
            entry.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + grace;
        for entry in entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, entry.handle).await.is_err() {
                warn!("action did not finish within shutdown grace period, aborting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_submission_for_same_issue_is_dropped() {
        let dispatcher = Dispatcher::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let outcome1 = dispatcher
            .submit("acme/web#1".to_string(), move |_cancel| async move {
                let _ = rx.await;
            })
            .await;
        assert_eq!(outcome1, SubmitOutcome::Started);

        let outcome2 = dispatcher
            .submit("acme/web#1".to_string(), |_cancel| async move {})
            .await;
        assert_eq!(outcome2, SubmitOutcome::DroppedAlreadyInFlight);

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn backpressure_drops_when_pool_saturated() {
        let dispatcher = Dispatcher::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        dispatcher
            .submit("acme/web#1".to_string(), move |_cancel| async move {
                let _ = rx.await;
            })
            .await;

        let outcome = dispatcher
            .submit("acme/web#2".to_string(), |_cancel| async move {})
            .await;
        assert_eq!(outcome, SubmitOutcome::DroppedBackpressure);

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent_workflows() {
        let dispatcher = Arc::new(Dispatcher::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            dispatcher
                .submit(format!("acme/web#{i}"), move |_cancel| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancel_and_wait_cancels_token_and_removes_entry() {
        let dispatcher = Dispatcher::new(1);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled_clone = cancelled.clone();
        dispatcher
            .submit("acme/web#1".to_string(), move |cancel| async move {
                cancel.cancelled().await;
                cancelled_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        dispatcher.cancel_and_wait("acme/web#1").await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_in_flight("acme/web#1").await);
    }

    #[tokio::test]
    async fn shutdown_cancels_all_in_flight_actions() {
        let dispatcher = Dispatcher::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..2 {
            let done = done.clone();
            dispatcher
                .submit(format!("acme/web#{i}"), move |cancel| async move {
                    cancel.cancelled().await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        dispatcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
