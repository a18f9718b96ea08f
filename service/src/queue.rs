use std::collections::VecDeque;
use std::sync::OnceLock;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The process-wide job queue. At most one job executes at a time;
/// enqueueing a job that is already queued or running restarts it, canceling
/// the in-flight instance and queueing the replacement.
pub struct JobQueue {
    pending: Mutex<VecDeque<Uuid>>,
    notify: Notify,
    running: Mutex<Option<RunningJob>>,
}

struct RunningJob {
    id: Uuid,
    cancel: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The in-flight instance was canceled and the job queued again.
    Restarted,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::default(),
            notify: Notify::new(),
            running: Mutex::default(),
        }
    }

    /// The single instance, lazily initialized on first use.
    pub fn global() -> &'static JobQueue {
        static QUEUE: OnceLock<JobQueue> = OnceLock::new();
        QUEUE.get_or_init(JobQueue::new)
    }

    pub async fn enqueue(&self, id: Uuid) -> EnqueueOutcome {
        let restarted = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(current) if current.id == id => {
                    current.cancel.cancel();
                    true
                }
                _ => false,
            }
        };

        let mut pending = self.pending.lock().await;
        if !pending.contains(&id) {
            pending.push_back(id);
        }
        drop(pending);
        self.notify.notify_one();

        if restarted {
            EnqueueOutcome::Restarted
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Wait for the next job id. Exclusive execution is handed out through
    /// [`JobQueue::begin`], which the consumer calls before running it.
    pub async fn dequeue(&self) -> Uuid {
        loop {
            if let Some(id) = self.pending.lock().await.pop_front() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    /// Register the job as the one executing instance and get its run token.
    pub async fn begin(&self, id: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.running.lock().await = Some(RunningJob {
            id,
            cancel: cancel.clone(),
        });
        cancel
    }

    pub async fn finish(&self, id: Uuid) {
        let mut running = self.running.lock().await;
        if running.as_ref().map(|r| r.id == id).unwrap_or(false) {
            *running = None;
        }
    }

    /// Cancel the executing instance of `id`, if that is what's running.
    pub async fn cancel_running(&self, id: Uuid) -> bool {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(current) if current.id == id => {
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.lock().await.as_ref().map(|r| r.id == id).unwrap_or(false)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_and_dedupe() {
        let queue = JobQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(queue.enqueue(a).await, EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(b).await, EnqueueOutcome::Queued);
        // Already pending: no duplicate entry.
        assert_eq!(queue.enqueue(a).await, EnqueueOutcome::Queued);

        assert_eq!(queue.dequeue().await, a);
        assert_eq!(queue.dequeue().await, b);
        assert!(queue.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reenqueue_restarts_the_running_instance() {
        let queue = JobQueue::new();
        let a = Uuid::new_v4();

        queue.enqueue(a).await;
        let id = queue.dequeue().await;
        let token = queue.begin(id).await;
        assert!(queue.is_running(a).await);

        assert_eq!(queue.enqueue(a).await, EnqueueOutcome::Restarted);
        assert!(token.is_cancelled());
        // The replacement is waiting.
        assert_eq!(queue.dequeue().await, a);

        queue.finish(a).await;
        assert!(!queue.is_running(a).await);
    }
}
