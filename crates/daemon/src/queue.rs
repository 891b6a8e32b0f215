//! Local job queue
//!
//! One authoritative FIFO for jobs awaiting the local worker. The depth counter lives next to
//! the channel so "position in line" can never drift from what is actually queued.

use crate::jobs::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
    depth: AtomicUsize,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    /// Append a job; returns its 1-based position in line.
    pub fn enqueue(&self, job: Job) -> usize {
        let position = self.inner.depth.fetch_add(1, Ordering::SeqCst) + 1;
        // The receiver lives in `inner`, so the channel cannot be closed while we hold it
        if let Err(mpsc::error::SendError(job)) = self.inner.tx.send(job) {
            self.inner.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(job_id = %job.id, "job queue closed; dropping job");
        }
        position
    }

    /// Wait for the next job.
    ///
    /// Returns `None` only if the channel closed, which cannot happen while the queue exists.
    pub async fn dequeue(&self) -> Option<Job> {
        let job = self.inner.rx.lock().await.recv().await;
        if job.is_some() {
            self.inner.depth.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Jobs waiting to be picked up (not counting the one being encoded).
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
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
    use crate::workspace::WorkspaceManager;

    fn job(manager: &WorkspaceManager, id: &str) -> Job {
        Job::new(id.to_string(), "mp4".to_string(), manager.acquire(id).unwrap(), None)
    }

    #[tokio::test]
    async fn test_fifo_order_and_depth() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let queue = JobQueue::new();

        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.enqueue(job(&manager, "a")), 1);
        assert_eq!(queue.enqueue(job(&manager, "b")), 2);
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.dequeue().await.unwrap().id, "a");
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.dequeue().await.unwrap().id, "b");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let queue = JobQueue::new();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.map(|j| j.id.clone()) })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job(&manager, "late"));

        assert_eq!(consumer.await.unwrap().as_deref(), Some("late"));
        assert_eq!(queue.depth(), 0);
    }
}
