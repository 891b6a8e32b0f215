//! Daemon startup and main loop for vidrelay
//!
//! Wires configuration, the encoder, the local worker and the HTTP server together.

use crate::concurrency::{derive_plan, ResourcePlan};
use crate::config::{Config, ConfigError};
use crate::delivery::{ChatSink, DeliveryService, DiscordSink};
use crate::dispatch::{expire_stale_remote_jobs, DispatchArbiter, HttpRemoteWorker, PendingRemote, RemoteWorker};
use crate::encode::{Encoder, EncoderSettings, FfmpegEncoder};
use crate::intake::{DestinationBinding, Intake};
use crate::ladder::{CompressionLadder, LadderSettings};
use crate::metrics::{collect_system_metrics, new_shared_metrics, timestamp_ms, SharedMetrics};
use crate::queue::JobQueue;
use crate::report::FailureReporter;
use crate::server::{create_router, serve, AppState, ServerError, SharedState};
use crate::startup::{primary_codec_without_checks, run_startup_checks, StartupError};
use crate::worker::{JobProcessor, LocalWorker};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Workspace root unusable: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// One-shot readiness signal: the server waits for it before binding
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Readiness::mark_ready`] has been called.
    pub async fn wait_ready(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// External collaborators, injectable for tests
pub struct Components {
    pub encoder: Arc<dyn Encoder>,
    pub chat: Arc<dyn ChatSink>,
    pub remote: Option<Arc<dyn RemoteWorker>>,
    pub reporter: FailureReporter,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived encoder resource plan
    pub resources: ResourcePlan,
    /// H.264 encoder chosen at startup
    pub primary_codec: String,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    state: SharedState,
    queue: JobQueue,
    processor: Arc<JobProcessor>,
    readiness: Readiness,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// This performs the full startup sequence:
    /// 1. Run startup checks (ffmpeg, ffprobe, encoder selection) unless skipped
    /// 2. Prepare the workspace root
    /// 3. Derive the resource plan
    /// 4. Build the HTTP clients for chat, remote worker and alert webhook
    pub async fn new(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        let primary_codec = if skip_checks {
            primary_codec_without_checks(&config)
        } else {
            let cfg = config.clone();
            tokio::task::spawn_blocking(move || run_startup_checks(&cfg))
                .await
                .map_err(|e| StartupError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??
                .primary_codec
        };

        let resources = derive_plan(&config);
        let client = reqwest::Client::builder()
            .user_agent(concat!("vidrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let encoder = FfmpegEncoder::new(
            EncoderSettings::from_config(&config, resources.clone()),
            config.encoder.ffprobe_path.clone(),
        );
        let components = Components {
            encoder: Arc::new(encoder),
            chat: Arc::new(DiscordSink::from_config(client.clone(), &config)),
            remote: HttpRemoteWorker::from_config(client.clone(), &config)
                .map(|w| Arc::new(w) as Arc<dyn RemoteWorker>),
            reporter: FailureReporter::from_config(client, &config),
        };

        if config.delivery.bot_token.is_none() {
            tracing::warn!("no chat bot token configured; deliveries will fail");
        }
        if !components.reporter.is_enabled() {
            tracing::warn!("no alert webhook configured; failures are only logged");
        }

        Self::with_components(config, primary_codec, components)
    }

    /// Initialize the daemon around already constructed collaborators
    pub fn with_components(
        config: Config,
        primary_codec: String,
        components: Components,
    ) -> Result<Self, DaemonError> {
        let resources = derive_plan(&config);
        let metrics = new_shared_metrics();
        let workspaces = WorkspaceManager::new(config.workspace.root.clone());
        workspaces.prepare_root()?;

        let queue = JobQueue::new();
        let pending = PendingRemote::new();
        let binding = Arc::new(DestinationBinding::new());
        let delivery = DeliveryService::from_config(components.chat, &config);

        let ladder = CompressionLadder::new(
            components.encoder,
            LadderSettings::from_config(&config, primary_codec.clone()),
        );
        let processor = Arc::new(JobProcessor::new(
            ladder,
            delivery.clone(),
            components.reporter.clone(),
            workspaces.clone(),
            metrics.clone(),
        ));

        let arbiter = Arc::new(DispatchArbiter::new(
            components.remote,
            queue.clone(),
            pending.clone(),
            workspaces.clone(),
            components.reporter.clone(),
            metrics.clone(),
        ));
        let state = Arc::new(AppState {
            intake: Intake::new(workspaces.clone(), arbiter, binding.clone()),
            binding,
            pending,
            delivery,
            reporter: components.reporter,
            workspaces,
            metrics: metrics.clone(),
            public_url: config.server.public_url.clone(),
            max_upload_bytes: config.server.max_upload_bytes,
        });

        Ok(Self {
            config,
            resources,
            primary_codec,
            metrics,
            state,
            queue,
            processor,
            readiness: Readiness::new(),
        })
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Spawn the single local worker
    ///
    /// The daemon becomes ready once the worker task is running.
    pub fn start_worker(&self) -> tokio::task::JoinHandle<()> {
        let worker = LocalWorker::new(self.processor.clone(), self.queue.clone());
        let readiness = self.readiness.clone();
        tokio::spawn(async move {
            readiness.mark_ready();
            worker.run().await
        })
    }

    /// Periodically fail remote jobs whose callback never arrived
    pub fn start_pending_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let max_age = Duration::from_secs(self.config.remote.callback_timeout_secs);
        let period = (max_age / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let expired =
                    expire_stale_remote_jobs(&state.pending, max_age, &state.reporter, &state.metrics).await;
                if expired > 0 {
                    tracing::warn!(expired, "remote jobs expired without a callback");
                }
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically updates system metrics in the shared state.
    pub fn start_metrics_updater(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                let system_metrics = tokio::task::spawn_blocking(collect_system_metrics)
                    .await
                    .unwrap_or_default();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system_metrics;
                    snapshot.timestamp_unix_ms = timestamp_ms();
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the background tasks, waits until the local worker is running and serves HTTP.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let _worker = self.start_worker();
        let _updater = self.start_metrics_updater();
        let _sweeper = self.start_pending_sweeper();

        self.readiness.wait_ready().await;
        let listener = tokio::net::TcpListener::bind(&self.config.server.bind)
            .await
            .map_err(ServerError::from)?;
        tracing::info!(
            bind = %self.config.server.bind,
            primary_codec = %self.primary_codec,
            threads = self.resources.encoder_threads,
            "vidrelay listening"
        );
        serve(listener, self.router()).await?;
        Ok(())
    }
}
