//! Per-job cancellation signals.
//!
//! A `watch` channel per job id: raising the flag is idempotent, tokens
//! are cheap to clone, and the runner can await the transition while a
//! subprocess is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a job, creating the channel on first use.
    pub fn token(&self, job_id: Uuid) -> CancelToken {
        let mut inner = self.inner.lock().unwrap();
        let sender = inner.entry(job_id).or_insert_with(|| {
            let (tx, _rx) = watch::channel(false);
            tx
        });
        CancelToken {
            receiver: sender.subscribe(),
        }
    }

    /// Raises the cancel flag. Returns false when no orchestrator has
    /// registered the job in this process.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.get(&job_id) {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    /// Drops the channel once the job reaches a terminal state.
    pub fn remove(&self, job_id: Uuid) {
        self.inner.lock().unwrap().remove(&job_id);
    }
}

#[derive(Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the flag is raised; immediately if it already is.
    pub async fn cancelled(&mut self) {
        if *self.receiver.borrow() {
            return;
        }
        while self.receiver.changed().await.is_ok() {
            if *self.receiver.borrow() {
                return;
            }
        }
        // Registry dropped without a cancel; never resolve.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_is_observed_by_existing_tokens() {
        let registry = CancellationRegistry::new();
        let job_id = Uuid::new_v4();
        let token = registry.token(job_id);
        assert!(!token.is_cancelled());

        assert!(registry.cancel(job_id));
        assert!(token.is_cancelled());

        let mut waiter = registry.token(job_id);
        tokio::time::timeout(Duration::from_secs(1), waiter.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_a_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = CancellationRegistry::new();
        let job_id = Uuid::new_v4();
        let token = registry.token(job_id);
        assert!(registry.cancel(job_id));
        assert!(registry.cancel(job_id));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn pending_token_resolves_on_later_cancel() {
        let registry = CancellationRegistry::new();
        let job_id = Uuid::new_v4();
        let mut token = registry.token(job_id);

        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry_clone.cancel(job_id);
        });

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("cancelled() should resolve after cancel");
    }
}
