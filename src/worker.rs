//! Worker pool (§5): N concurrent slots pulling `JobData` off a `JobQueue`
//! and driving each job through its orchestrator. Grounded in the teacher's
//! `JobManager::start_all` — a `tokio::spawn` per slot plus a `oneshot`
//! cancellation signal per slot — generalized from "one task per named job"
//! to "one task per worker slot, looping over whatever the queue hands it".

use crate::config::EngineConfig;
use crate::lock::LockBackend;
use crate::orchestrator::{ExportOrchestrator, ImportOrchestrator};
use crate::queue::{JobData, JobQueue};
use log::{error, info};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A running pool of worker slots. Dropping this without calling
/// [`WorkerPool::shutdown`] abandons the slots; `shutdown` is the orderly path.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancels: Vec<oneshot::Sender<()>>,
}

impl WorkerPool {
    /// Spawns `config.worker_slots` tasks, each looping `queue.pop()` and
    /// dispatching to the matching orchestrator until told to stop.
    pub fn spawn<B: LockBackend>(
        queue: Arc<dyn JobQueue>,
        import_orchestrator: Arc<ImportOrchestrator<B>>,
        export_orchestrator: Arc<ExportOrchestrator<B>>,
        config: &EngineConfig,
    ) -> Self {
        let mut handles = Vec::with_capacity(config.worker_slots);
        let mut cancels = Vec::with_capacity(config.worker_slots);

        for slot in 0..config.worker_slots {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let queue = queue.clone();
            let import_orchestrator = import_orchestrator.clone();
            let export_orchestrator = export_orchestrator.clone();

            let handle = tokio::spawn(async move {
                run_slot(slot, queue, import_orchestrator, export_orchestrator, cancel_rx).await;
            });

            handles.push(handle);
            cancels.push(cancel_tx);
        }

        Self { handles, cancels }
    }

    /// Signals every slot to stop after its current job, then waits for them
    /// to drain. A slot blocked in `queue.pop()` with no more jobs coming
    /// needs the queue closed for this to return promptly.
    pub async fn shutdown(self) {
        for cancel in self.cancels {
            let _ = cancel.send(());
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker slot task panicked: {e}");
            }
        }
    }
}

async fn run_slot<B: LockBackend>(
    slot: usize,
    queue: Arc<dyn JobQueue>,
    import_orchestrator: Arc<ImportOrchestrator<B>>,
    export_orchestrator: Arc<ExportOrchestrator<B>>,
    mut cancel: oneshot::Receiver<()>,
) {
    info!("worker slot {slot} started");
    loop {
        let job = tokio::select! {
            biased;
            _ = &mut cancel => {
                info!("worker slot {slot} stopping");
                return;
            }
            job = queue.pop() => job,
        };

        match job {
            None => {
                info!("worker slot {slot}: queue closed, stopping");
                return;
            }
            Some(JobData::Import(id)) => {
                if let Err(e) = import_orchestrator.run(id).await {
                    error!("worker slot {slot}: import job {id} failed: {e}");
                }
            }
            Some(JobData::Export(id)) => {
                if let Err(e) = export_orchestrator.run(id).await {
                    error!("worker slot {slot}: export job {id} failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::error::{EngineError, StoreError};
    use crate::lock::memory::InMemoryLockBackend;
    use crate::lock::LockManager;
    use crate::model::{Counters, Metrics};
    use crate::orchestrator::{JobRunner, Pipeline, PipelineOutcome, ProgressSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    struct CountingSink;

    #[async_trait]
    impl ProgressSink for CountingSink {
        async fn report(&self, _counters: Counters) {}
    }

    struct StubPipeline {
        ran: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Pipeline for StubPipeline {
        type Job = ();

        fn lock_key(&self, id: Uuid) -> String {
            format!("stub:{id}")
        }

        async fn begin(&self, _id: Uuid, _node_id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn progress_sink(&self, _id: Uuid) -> Box<dyn ProgressSink> {
            Box::new(CountingSink)
        }

        async fn execute(&self, _job: &(), _progress: &dyn ProgressSink) -> Result<PipelineOutcome, EngineError> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok(PipelineOutcome {
                counters: Counters::default(),
                errors: Vec::new(),
                metrics: Metrics::default(),
                export_artifact: None,
            })
        }

        async fn finalize_success(&self, _id: Uuid, _outcome: PipelineOutcome) -> Result<(), StoreError> {
            Ok(())
        }

        async fn finalize_failure(&self, _id: Uuid, _message: String) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_slot_pops_and_drives_a_job_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let lock_manager = Arc::new(LockManager::new("node-a", InMemoryLockBackend::new()));
        let config = EngineConfig::new();
        let pipeline = StubPipeline { ran: ran.clone() };
        let runner = JobRunner::new(pipeline, lock_manager, "node-a", config);

        let id = Uuid::new_v4();
        runner.run(id).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
