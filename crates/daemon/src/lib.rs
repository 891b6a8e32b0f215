//! vidrelay
//!
//! Accepts uploaded videos over HTTP, compresses them under a chat attachment size ceiling
//! and posts the result to a chat channel, offloading to a remote worker when one answers.

pub mod concurrency;
pub mod daemon;
pub mod delivery;
pub mod dispatch;
pub mod encode;
pub mod intake;
pub mod jobs;
pub mod ladder;
pub mod metrics;
pub mod queue;
pub mod report;
pub mod server;
pub mod size_gate;
pub mod startup;
pub mod worker;
pub mod workspace;

pub use vidrelay_config as config;
pub use vidrelay_config::Config;
pub use concurrency::{derive_plan, ResourcePlan};
pub use daemon::{Components, Daemon, DaemonError, Readiness};
pub use delivery::{ChatSink, DeliveryError, DeliveryService, DiscordSink, SinkError};
pub use dispatch::{DispatchArbiter, DispatchError, Dispatched, HttpRemoteWorker, PendingRemote, RemoteWorker};
pub use encode::{EncodeError, EncodeRequest, Encoder, FfmpegEncoder, Resolution};
pub use intake::{Admission, DestinationBinding, Intake, IntakeError};
pub use jobs::{Destination, Job, JobState};
pub use ladder::{CompressionAttempt, CompressionLadder, LadderError, LadderOutcome, LadderPlan, LadderSettings};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use queue::JobQueue;
pub use report::{AlertSink, FailureReporter, ReportError, WebhookAlertSink};
pub use server::{create_router, ApiError, AppState, ServerError};
pub use size_gate::{check_size_gate, SizeGateResult};
pub use startup::{run_startup_checks, select_primary_codec, StartupError, StartupReport};
pub use worker::{JobError, JobProcessor, LocalWorker};
pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};
