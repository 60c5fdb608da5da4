//! Job queue abstraction (§5): decouples the worker pool from however jobs
//! are actually delivered (the teacher's ancestor used a cron schedule; this
//! engine is delivery-driven instead, so the abstraction is a plain queue).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What a worker slot picks up off the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobData {
    Import(Uuid),
    Export(Uuid),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: JobData);
    /// Blocks until a job is available or the queue is closed (`None`).
    async fn pop(&self) -> Option<JobData>;
}

/// `tokio::sync::mpsc`-backed in-memory queue; the default wiring for a
/// single-process deployment and for tests.
pub struct InMemoryJobQueue {
    sender: tokio::sync::mpsc::UnboundedSender<JobData>,
    receiver: Arc<Mutex<tokio::sync::mpsc::UnboundedReceiver<JobData>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: JobData) {
        let _ = self.sender.send(job);
    }

    async fn pop(&self) -> Option<JobData> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pushed_jobs_are_popped_in_order() {
        let queue = InMemoryJobQueue::new();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        queue.push(JobData::Import(id_a)).await;
        queue.push(JobData::Export(id_b)).await;

        assert_eq!(queue.pop().await, Some(JobData::Import(id_a)));
        assert_eq!(queue.pop().await, Some(JobData::Export(id_b)));
    }
}
