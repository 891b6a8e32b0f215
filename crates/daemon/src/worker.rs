//! Local worker for vidrelay
//!
//! Runs queued jobs through the compression ladder and delivery, one at a time.

use crate::delivery::{DeliveryError, DeliveryService};
use crate::jobs::{Job, JobState};
use crate::ladder::{CompressionLadder, LadderError, LadderOutcome, LadderPaths};
use crate::metrics::{JobMetrics, SharedMetrics};
use crate::queue::JobQueue;
use crate::report::FailureReporter;
use crate::workspace::{WorkspaceError, WorkspaceManager};
use std::sync::Arc;
use thiserror::Error;

/// Job-terminal failures
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("{0}")]
    Compression(#[from] LadderError),

    #[error("{0}")]
    Delivery(#[from] DeliveryError),
}

/// Takes one job from `LocalQueued` to a terminal state
pub struct JobProcessor {
    ladder: CompressionLadder,
    delivery: DeliveryService,
    reporter: FailureReporter,
    workspaces: WorkspaceManager,
    metrics: SharedMetrics,
}

impl JobProcessor {
    pub fn new(
        ladder: CompressionLadder,
        delivery: DeliveryService,
        reporter: FailureReporter,
        workspaces: WorkspaceManager,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            ladder,
            delivery,
            reporter,
            workspaces,
            metrics,
        }
    }

    /// Compress and deliver `job`.
    ///
    /// Failures are reported before returning, and the workspace is released on every path.
    pub async fn process(&self, mut job: Job) -> Result<(), JobError> {
        job.transition(JobState::LocalEncoding);
        self.update_job_metrics(&job, None).await;

        let result = self.run_pipeline(&mut job).await;

        match &result {
            Ok(outcome) => {
                job.transition(JobState::Delivered);
                let mut metrics = self.metrics.write().await;
                metrics.completed_jobs += 1;
                metrics.total_bytes_delivered += outcome.output_bytes;
            }
            Err(e) => {
                let log = job.workspace.existing_log();
                self.reporter.report(&job.id, e, log.as_deref()).await;
                job.transition(JobState::Failed(e.to_string()));
                self.metrics.write().await.failed_jobs += 1;
            }
        }

        self.metrics.write().await.remove_job(&job.id);
        self.workspaces.release(&mut job.workspace);
        result.map(|_| ())
    }

    async fn run_pipeline(&self, job: &mut Job) -> Result<LadderOutcome, JobError> {
        // Without a destination there is nothing worth encoding for
        if job.destination.is_none() {
            return Err(DeliveryError::ChannelUnavailable.into());
        }

        let paths = LadderPaths::for_workspace(&job.workspace, &job.source_extension);
        let outcome = self
            .ladder
            .compress(&job.id, &job.source_extension, &paths)
            .await?;

        tracing::info!(
            job_id = %job.id,
            bytes = outcome.output_bytes,
            attempts = outcome.attempts.len(),
            fallback = outcome.used_fallback(&self.ladder.settings().fallback_codec),
            "artifact under ceiling"
        );

        job.transition(JobState::Delivering);
        self.update_job_metrics(job, Some(&outcome)).await;

        self.delivery
            .deliver(job.destination.as_ref(), &outcome.artifact)
            .await?;
        Ok(outcome)
    }

    /// Account for a job whose task died before reaching a terminal state.
    ///
    /// The workspace was already dropped with the task.
    pub async fn report_aborted(&self, job_id: &str, reason: &str) {
        let error = format!("job task aborted: {}", reason);
        self.reporter.report(job_id, &error, None).await;
        let mut metrics = self.metrics.write().await;
        metrics.failed_jobs += 1;
        metrics.remove_job(job_id);
    }

    async fn update_job_metrics(&self, job: &Job, outcome: Option<&LadderOutcome>) {
        let mut entry = JobMetrics::new(job.id.clone(), job.state().as_str(), job.source_extension.clone());
        if let Some(outcome) = outcome {
            entry.attempts = outcome.attempts.len() as u32;
            entry.output_bytes = Some(outcome.output_bytes);
            if let Some(last) = outcome.attempts.last() {
                entry.crf = Some(last.crf);
                entry.codec = Some(last.codec.clone());
            }
        }
        self.metrics.write().await.upsert_job(entry);
    }
}

/// The single consumer of the local queue
pub struct LocalWorker {
    processor: Arc<JobProcessor>,
    queue: JobQueue,
}

impl LocalWorker {
    pub fn new(processor: Arc<JobProcessor>, queue: JobQueue) -> Self {
        Self { processor, queue }
    }

    /// Process jobs in FIFO order until the queue closes.
    ///
    /// Each job runs to completion before the next is dequeued.
    pub async fn run(self) {
        tracing::info!("local worker started");
        while let Some(job) = self.queue.dequeue().await {
            let job_id = job.id.clone();
            tracing::info!(job_id = %job_id, waiting = self.queue.depth(), "local job started");

            // A panicking job must not take the worker down with it
            let processor = Arc::clone(&self.processor);
            match tokio::spawn(async move { processor.process(job).await }).await {
                Ok(Ok(())) => tracing::info!(job_id = %job_id, "local job delivered"),
                Ok(Err(_)) => {}
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "local job task aborted");
                    self.processor.report_aborted(&job_id, &e.to_string()).await;
                }
            }
        }
        tracing::info!("local worker stopped");
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::FakeSink;
    use crate::encode::EncodeRequest;
    use crate::jobs::Destination;
    use crate::ladder::tests::FakeEncoder;
    use crate::ladder::LadderSettings;
    use crate::metrics::new_shared_metrics;
    use crate::delivery::{ChatSink, SinkError};
    use crate::report::tests::RecordingAlertSink;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Panics on the first send, then behaves.
    #[derive(Default)]
    struct PanicOnceSink {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl ChatSink for PanicOnceSink {
        async fn send_video(&self, _channel_id: u64, _content: &str, _artifact: &Path) -> Result<(), SinkError> {
            if self.sends.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("chat client bug");
            }
            Ok(())
        }
    }

    struct Harness {
        root: tempfile::TempDir,
        workspaces: WorkspaceManager,
        encoder: Arc<FakeEncoder>,
        sink: Arc<FakeSink>,
        alerts: Arc<RecordingAlertSink>,
        metrics: SharedMetrics,
        processor: Arc<JobProcessor>,
    }

    fn harness(encoder: FakeEncoder, sink: FakeSink) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(root.path());
        let encoder = Arc::new(encoder);
        let sink = Arc::new(sink);
        let alerts = Arc::new(RecordingAlertSink::default());
        let metrics = new_shared_metrics();
        let settings = LadderSettings {
            ceiling_bytes: 1000,
            probe_resolution: false,
            ..LadderSettings::default()
        };
        let processor = Arc::new(JobProcessor::new(
            CompressionLadder::new(encoder.clone(), settings),
            DeliveryService::new(sink.clone(), 3, Duration::ZERO),
            FailureReporter::new(Some(alerts.clone())),
            workspaces.clone(),
            metrics.clone(),
        ));
        Harness {
            root,
            workspaces,
            encoder,
            sink,
            alerts,
            metrics,
            processor,
        }
    }

    fn queued_job(h: &Harness, id: &str, destination: Option<Destination>) -> Job {
        let ws = h.workspaces.acquire(id).unwrap();
        std::fs::write(ws.source_path("mp4"), b"source").unwrap();
        let mut job = Job::new(id.to_string(), "mp4".to_string(), ws, destination);
        job.transition(JobState::Dispatching);
        job.transition(JobState::LocalQueued);
        job
    }

    fn fits(_: &EncodeRequest) -> Option<u64> {
        Some(500)
    }

    #[tokio::test]
    async fn test_happy_path_delivers_and_releases() {
        let h = harness(FakeEncoder::new(None, fits), FakeSink::default());
        let job = queued_job(&h, "ok", Some(Destination::new(5, "alice")));
        let dir = job.workspace.path().to_path_buf();

        h.processor.process(job).await.unwrap();

        assert!(!dir.exists());
        assert_eq!(h.sink.calls(), 1);
        assert_eq!(h.alerts.count(), 0);
        let m = h.metrics.read().await;
        assert_eq!(m.completed_jobs, 1);
        assert_eq!(m.total_bytes_delivered, 500);
        assert!(m.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_destination_fails_without_encoding() {
        let h = harness(FakeEncoder::new(None, fits), FakeSink::default());
        let job = queued_job(&h, "unbound", None);
        let dir = job.workspace.path().to_path_buf();

        let err = h.processor.process(job).await.unwrap_err();

        assert!(matches!(err, JobError::Delivery(DeliveryError::ChannelUnavailable)));
        assert!(h.encoder.requests().is_empty());
        assert_eq!(h.sink.calls(), 0);
        assert_eq!(h.alerts.count(), 1);
        assert!(!dir.exists());
        assert_eq!(h.metrics.read().await.failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_exhausted_ladder_is_reported_with_log() {
        let encoder = FakeEncoder::new(None, |req: &EncodeRequest| {
            if let Some(log) = &req.log_path {
                std::fs::write(log, b"encoder log").unwrap();
            }
            Some(5000)
        });
        let h = harness(encoder, FakeSink::default());
        let job = queued_job(&h, "huge", Some(Destination::new(5, "alice")));
        let dir = job.workspace.path().to_path_buf();

        let err = h.processor.process(job).await.unwrap_err();

        assert!(matches!(err, JobError::Compression(LadderError::Exhausted { .. })));
        assert_eq!(h.sink.calls(), 0);
        let posts = h.alerts.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].0.starts_with("[upload failed] job huge:"));
        assert_eq!(posts[0].1.as_ref().unwrap().1.as_slice(), b"encoder log");
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_delivery_exhaustion_is_reported_once() {
        let h = harness(FakeEncoder::new(None, fits), FakeSink::failing(10));
        let job = queued_job(&h, "flaky", Some(Destination::new(5, "alice")));
        let dir = job.workspace.path().to_path_buf();

        let err = h.processor.process(job).await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Delivery(DeliveryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(h.sink.calls(), 3);
        assert_eq!(h.alerts.count(), 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_workspace_released_for_every_fault() {
        let faults: Vec<(FakeEncoder, FakeSink, Option<Destination>)> = vec![
            (FakeEncoder::new(None, fits), FakeSink::default(), None),
            (FakeEncoder::new(None, |_: &EncodeRequest| None), FakeSink::default(), Some(Destination::new(1, "a"))),
            (FakeEncoder::new(None, fits), FakeSink::failing(3), Some(Destination::new(1, "a"))),
            (
                FakeEncoder::new(None, fits),
                FakeSink {
                    unknown_channel: true,
                    ..FakeSink::default()
                },
                Some(Destination::new(1, "a")),
            ),
            (FakeEncoder::new(None, fits), FakeSink::default(), Some(Destination::new(1, "a"))),
        ];

        for (i, (encoder, sink, destination)) in faults.into_iter().enumerate() {
            let h = harness(encoder, sink);
            let job = queued_job(&h, &format!("job{}", i), destination);
            let dir = job.workspace.path().to_path_buf();

            let _ = h.processor.process(job).await;

            assert!(!dir.exists(), "workspace {} survived", i);
            assert_eq!(std::fs::read_dir(h.root.path()).unwrap().count(), 0);
            assert!(h.alerts.count() <= 1);
        }
    }

    #[test]
    fn test_process_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let h = harness(FakeEncoder::new(None, fits), FakeSink::default());
        let job = queued_job(&h, "send", Some(Destination::new(1, "a")));
        assert_send(h.processor.process(job));
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported_and_worker_continues() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(root.path());
        let alerts = Arc::new(RecordingAlertSink::default());
        let metrics = new_shared_metrics();
        let sink = Arc::new(PanicOnceSink::default());
        let settings = LadderSettings {
            ceiling_bytes: 1000,
            probe_resolution: false,
            ..LadderSettings::default()
        };
        let processor = Arc::new(JobProcessor::new(
            CompressionLadder::new(Arc::new(FakeEncoder::new(None, fits)), settings),
            DeliveryService::new(sink.clone(), 3, Duration::ZERO),
            FailureReporter::new(Some(alerts.clone())),
            workspaces.clone(),
            metrics.clone(),
        ));
        let queue = JobQueue::new();
        for id in ["boom", "after"] {
            let ws = workspaces.acquire(id).unwrap();
            std::fs::write(ws.source_path("mp4"), b"source").unwrap();
            let mut job = Job::new(id.to_string(), "mp4".to_string(), ws, Some(Destination::new(2, "b")));
            job.transition(JobState::Dispatching);
            job.transition(JobState::LocalQueued);
            queue.enqueue(job);
        }

        let worker = LocalWorker::new(processor, queue).spawn();
        // The second job runs after the first one's panic, and leaves no directory behind
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = metrics.read().await.completed_jobs == 1;
                if done && std::fs::read_dir(root.path()).unwrap().count() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        worker.abort();

        {
            let posts = alerts.posts.lock().unwrap();
            assert_eq!(posts.len(), 1);
            assert!(posts[0].0.starts_with("[upload failed] job boom: job task aborted"));
        }
        let m = metrics.read().await;
        assert_eq!(m.failed_jobs, 1);
        assert!(m.jobs.is_empty());
        assert_eq!(sink.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_never_overlaps_encodes() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let encoder = {
            let active = active.clone();
            let peak = peak.clone();
            FakeEncoder::new(None, move |_: &EncodeRequest| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                active.fetch_sub(1, Ordering::SeqCst);
                Some(500)
            })
        };
        let h = harness(encoder, FakeSink::default());
        let queue = JobQueue::new();
        for id in ["first", "second", "third"] {
            queue.enqueue(queued_job(&h, id, Some(Destination::new(9, "u"))));
        }

        let worker = LocalWorker::new(h.processor.clone(), queue.clone()).spawn();
        tokio::time::timeout(Duration::from_secs(10), async {
            while h.sink.calls() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        worker.abort();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(), 0);
        let order: Vec<_> = h
            .encoder
            .requests()
            .iter()
            .map(|r| r.src.parent().unwrap().file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }
}
