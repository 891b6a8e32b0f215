//! Compression ladder
//!
//! Drives a sequence of encodes until the artifact fits under the size ceiling.
//!
//! The escalation order is data: a [`LadderPlan`] lists resolution tiers from least to most
//! lossy, each with a first CRF and an escalating CRF sequence, plus one alternate-codec
//! fallback. [`LadderMachine`] walks the plan one observation at a time and never touches the
//! filesystem; [`CompressionLadder`] executes its actions with an [`Encoder`].

use crate::config::Config;
use crate::encode::{EncodeError, EncodeRequest, Encoder, Resolution};
use crate::size_gate::{check_file, SizeGateResult};
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Canonical tiers, least lossy first.
pub const CANONICAL_TIERS: [Resolution; 3] = [
    Resolution::new(1920, 1080),
    Resolution::new(1280, 720),
    Resolution::new(854, 480),
];

/// Sources whose long edge is at most this keep their native size as the first tier.
pub const NATIVE_TIER_MAX_EDGE: u32 = 1080;

#[derive(Debug, Error)]
pub enum LadderError {
    /// Every tier, CRF step and the codec fallback stayed above the ceiling
    #[error("could not compress below {ceiling_bytes} bytes after {} attempts", attempts.len())]
    Exhausted {
        ceiling_bytes: u64,
        attempts: Vec<CompressionAttempt>,
    },
}

/// Ladder tuning, resolved from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LadderSettings {
    pub ceiling_bytes: u64,
    pub first_crf: u8,
    pub first_crf_mov: u8,
    pub crf_steps: Vec<u8>,
    pub fps_cap: u32,
    pub primary_codec: String,
    pub fallback_codec: String,
    pub fallback_crf: u8,
    pub probe_resolution: bool,
}

impl LadderSettings {
    /// `primary_codec` is the resolved H.264 encoder (see `startup::select_primary_codec`).
    pub fn from_config(cfg: &Config, primary_codec: impl Into<String>) -> Self {
        Self {
            ceiling_bytes: cfg.ladder.size_ceiling_bytes,
            first_crf: cfg.ladder.first_crf,
            first_crf_mov: cfg.ladder.first_crf_mov,
            crf_steps: cfg.ladder.crf_steps.clone(),
            fps_cap: cfg.ladder.fps_cap,
            primary_codec: primary_codec.into(),
            fallback_codec: cfg.encoder.fallback_codec.clone(),
            fallback_crf: cfg.ladder.fallback_crf,
            probe_resolution: cfg.ladder.probe_resolution,
        }
    }

    /// Initial CRF; QuickTime sources start more aggressively.
    pub fn first_crf_for(&self, ext: &str) -> u8 {
        if ext.eq_ignore_ascii_case("mov") {
            self.first_crf_mov
        } else {
            self.first_crf
        }
    }
}

impl Default for LadderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), "libx264")
    }
}

/// One resolution tier and its quantization sequence
#[derive(Debug, Clone, PartialEq)]
pub struct TierStep {
    /// Bounding box the source is scaled into (never upscaled)
    pub resolution: Resolution,
    pub first_crf: u8,
    /// CRFs above `first_crf`, strictly increasing, applied to the previous output
    pub crf_steps: Vec<u8>,
}

impl TierStep {
    /// Scale into the bounding box, keep aspect, cap the frame rate.
    pub fn filter(&self, fps_cap: u32) -> String {
        scale_filter(self.resolution, fps_cap)
    }

    /// Output size for a source of the given size.
    pub fn effective_resolution(&self, source: Resolution) -> Resolution {
        fit_within(source, self.resolution)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackStep {
    pub codec: String,
    pub crf: u8,
    pub resolution: Resolution,
}

/// The full escalation order for one job
#[derive(Debug, Clone, PartialEq)]
pub struct LadderPlan {
    pub ceiling_bytes: u64,
    pub codec: String,
    pub fps_cap: u32,
    pub tiers: Vec<TierStep>,
    pub fallback: FallbackStep,
}

impl LadderPlan {
    /// Build the plan for a source with extension `ext` and optional probed resolution.
    ///
    /// Portrait sources get portrait tiers. Tiers that would produce the same output size as
    /// the tier before them are dropped.
    pub fn build(settings: &LadderSettings, ext: &str, native: Option<Resolution>) -> Self {
        let first_crf = settings.first_crf_for(ext);
        let portrait = native.map(|r| r.height > r.width).unwrap_or(false);

        let mut boxes = Vec::with_capacity(CANONICAL_TIERS.len() + 1);
        if let Some(native) = native.filter(|r| r.long_edge() <= NATIVE_TIER_MAX_EDGE) {
            boxes.push(native);
        }
        boxes.extend(CANONICAL_TIERS.iter().map(|r| orient(*r, portrait)));

        // Escalation continues from the tier's first CRF, never at or below it
        let mut steps: Vec<u8> = settings.crf_steps.clone();
        steps.sort_unstable();
        steps.dedup();
        steps.retain(|&crf| crf > first_crf);

        let mut tiers: Vec<TierStep> = Vec::with_capacity(boxes.len());
        for resolution in boxes {
            if let (Some(native), Some(prev)) = (native, tiers.last()) {
                if fit_within(native, resolution) == prev.effective_resolution(native) {
                    continue;
                }
            }
            tiers.push(TierStep {
                resolution,
                first_crf,
                crf_steps: steps.clone(),
            });
        }

        let smallest = tiers
            .last()
            .map(|t| t.resolution)
            .unwrap_or_else(|| orient(CANONICAL_TIERS[CANONICAL_TIERS.len() - 1], portrait));

        Self {
            ceiling_bytes: settings.ceiling_bytes,
            codec: settings.primary_codec.clone(),
            fps_cap: settings.fps_cap,
            tiers,
            fallback: FallbackStep {
                codec: settings.fallback_codec.clone(),
                crf: settings.fallback_crf,
                resolution: smallest,
            },
        }
    }
}

fn orient(resolution: Resolution, portrait: bool) -> Resolution {
    if portrait {
        Resolution::new(resolution.height, resolution.width)
    } else {
        resolution
    }
}

/// Largest size with the source's aspect ratio inside `bounds`, never larger than the source.
fn fit_within(source: Resolution, bounds: Resolution) -> Resolution {
    if source.width <= bounds.width && source.height <= bounds.height {
        return source;
    }
    let scale_w = bounds.width as f64 / source.width as f64;
    let scale_h = bounds.height as f64 / source.height as f64;
    let scale = scale_w.min(scale_h);
    let even = |v: f64| ((v.round() as u32) / 2 * 2).max(2);
    Resolution::new(even(source.width as f64 * scale), even(source.height as f64 * scale))
}

fn scale_filter(bounds: Resolution, fps_cap: u32) -> String {
    format!(
        "scale='min(iw,{w})':'min(ih,{h})':force_original_aspect_ratio=decrease:force_divisible_by=2,fps={fps}",
        w = bounds.width,
        h = bounds.height,
        fps = fps_cap
    )
}

/// Position of the machine in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    /// Encode the source at tier `tier`'s first CRF
    TryTier { tier: usize },
    /// Re-encode the current artifact at `crf_steps[step]`
    StepQuantization { tier: usize, step: usize },
    /// Encode the source once with the alternate codec
    FallbackCodec,
    Success,
    Exhausted,
}

/// What the executor must do next
#[derive(Debug, Clone, PartialEq)]
pub enum LadderAction {
    EncodeSource {
        codec: String,
        crf: u8,
        resolution: Resolution,
        filter: String,
    },
    Reencode {
        codec: String,
        crf: u8,
    },
}

impl LadderAction {
    pub fn crf(&self) -> u8 {
        match self {
            LadderAction::EncodeSource { crf, .. } | LadderAction::Reencode { crf, .. } => *crf,
        }
    }
}

/// Result of executing one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Fits,
    TooLarge,
    /// The encoder failed or produced nothing
    Failed,
}

/// Pure walk over a [`LadderPlan`]
#[derive(Debug, Clone)]
pub struct LadderMachine {
    plan: LadderPlan,
    state: LadderState,
}

impl LadderMachine {
    pub fn new(plan: LadderPlan) -> Self {
        let state = if plan.tiers.is_empty() {
            LadderState::FallbackCodec
        } else {
            LadderState::TryTier { tier: 0 }
        };
        Self { plan, state }
    }

    pub fn state(&self) -> LadderState {
        self.state
    }

    pub fn plan(&self) -> &LadderPlan {
        &self.plan
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, LadderState::Success | LadderState::Exhausted)
    }

    /// The action for the current state; `None` once finished.
    pub fn action(&self) -> Option<LadderAction> {
        match self.state {
            LadderState::TryTier { tier } => {
                let step = &self.plan.tiers[tier];
                Some(LadderAction::EncodeSource {
                    codec: self.plan.codec.clone(),
                    crf: step.first_crf,
                    resolution: step.resolution,
                    filter: step.filter(self.plan.fps_cap),
                })
            }
            LadderState::StepQuantization { tier, step } => Some(LadderAction::Reencode {
                codec: self.plan.codec.clone(),
                crf: self.plan.tiers[tier].crf_steps[step],
            }),
            LadderState::FallbackCodec => {
                let fallback = &self.plan.fallback;
                Some(LadderAction::EncodeSource {
                    codec: fallback.codec.clone(),
                    crf: fallback.crf,
                    resolution: fallback.resolution,
                    filter: scale_filter(fallback.resolution, self.plan.fps_cap),
                })
            }
            LadderState::Success | LadderState::Exhausted => None,
        }
    }

    /// Advance after the current action produced `outcome`.
    pub fn observe(&mut self, outcome: StepOutcome) {
        self.state = match (self.state, outcome) {
            (LadderState::Success, _) | (LadderState::Exhausted, _) => self.state,
            (_, StepOutcome::Fits) => LadderState::Success,
            (LadderState::TryTier { tier }, StepOutcome::TooLarge) => {
                if self.plan.tiers[tier].crf_steps.is_empty() {
                    self.next_tier(tier)
                } else {
                    LadderState::StepQuantization { tier, step: 0 }
                }
            }
            // Nothing to re-encode
            (LadderState::TryTier { tier }, StepOutcome::Failed) => self.next_tier(tier),
            // A failed re-encode leaves the previous artifact intact, so keep escalating
            (LadderState::StepQuantization { tier, step }, _) => {
                if step + 1 < self.plan.tiers[tier].crf_steps.len() {
                    LadderState::StepQuantization {
                        tier,
                        step: step + 1,
                    }
                } else {
                    self.next_tier(tier)
                }
            }
            (LadderState::FallbackCodec, _) => LadderState::Exhausted,
        };
    }

    fn next_tier(&self, tier: usize) -> LadderState {
        if tier + 1 < self.plan.tiers.len() {
            LadderState::TryTier { tier: tier + 1 }
        } else {
            LadderState::FallbackCodec
        }
    }
}

/// Ephemeral record of one encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionAttempt {
    pub codec: String,
    pub crf: u8,
    pub filter: Option<String>,
    /// Size of the resulting artifact; None when the encode failed
    pub output_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LadderOutcome {
    /// Artifact at or under the ceiling
    pub artifact: PathBuf,
    pub output_bytes: u64,
    pub attempts: Vec<CompressionAttempt>,
}

impl LadderOutcome {
    pub fn used_fallback(&self, fallback_codec: &str) -> bool {
        self.attempts
            .last()
            .map(|a| a.codec == fallback_codec)
            .unwrap_or(false)
    }
}

/// Files one ladder run reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct LadderPaths {
    pub source: PathBuf,
    pub output: PathBuf,
    pub tmp: PathBuf,
    pub log: Option<PathBuf>,
}

impl LadderPaths {
    pub fn for_workspace(workspace: &Workspace, ext: &str) -> Self {
        Self {
            source: workspace.source_path(ext),
            output: workspace.output_path(),
            tmp: workspace.tmp_path(),
            log: Some(workspace.log_path()),
        }
    }
}

/// Executes ladder plans against an [`Encoder`]
#[derive(Clone)]
pub struct CompressionLadder {
    encoder: Arc<dyn Encoder>,
    settings: LadderSettings,
}

impl CompressionLadder {
    pub fn new(encoder: Arc<dyn Encoder>, settings: LadderSettings) -> Self {
        Self { encoder, settings }
    }

    pub fn settings(&self) -> &LadderSettings {
        &self.settings
    }

    /// Produce an artifact at `paths.output` no larger than the ceiling.
    ///
    /// Encoder failures are absorbed and move the ladder on; only exhaustion is an error.
    /// `paths.tmp` never survives this call.
    pub async fn compress(
        &self,
        job_id: &str,
        ext: &str,
        paths: &LadderPaths,
    ) -> Result<LadderOutcome, LadderError> {
        let native = if self.settings.probe_resolution {
            self.probe(&paths.source).await
        } else {
            None
        };
        let plan = LadderPlan::build(&self.settings, ext, native);
        tracing::info!(
            job_id,
            ?native,
            tiers = plan.tiers.len(),
            first_crf = self.settings.first_crf_for(ext),
            "starting compression ladder"
        );

        let mut machine = LadderMachine::new(plan);
        let mut attempts = Vec::new();

        while let Some(action) = machine.action() {
            let (outcome, attempt) = self.execute(&action, paths).await;
            tracing::info!(
                job_id,
                codec = %attempt.codec,
                crf = attempt.crf,
                bytes = ?attempt.output_bytes,
                ?outcome,
                "ladder step finished"
            );
            attempts.push(attempt);
            machine.observe(outcome);
        }

        remove_if_exists(&paths.tmp);

        match machine.state() {
            LadderState::Success => match check_file(&paths.output, self.settings.ceiling_bytes) {
                SizeGateResult::Accept { output_bytes } => Ok(LadderOutcome {
                    artifact: paths.output.clone(),
                    output_bytes,
                    attempts,
                }),
                // The machine only reaches Success after an accepted size check
                _ => Err(LadderError::Exhausted {
                    ceiling_bytes: self.settings.ceiling_bytes,
                    attempts,
                }),
            },
            _ => Err(LadderError::Exhausted {
                ceiling_bytes: self.settings.ceiling_bytes,
                attempts,
            }),
        }
    }

    async fn execute(&self, action: &LadderAction, paths: &LadderPaths) -> (StepOutcome, CompressionAttempt) {
        let (request, reencode) = match action {
            LadderAction::EncodeSource {
                codec, crf, filter, ..
            } => {
                // A failed encode must not leave an older artifact to be measured
                remove_if_exists(&paths.output);
                (
                    EncodeRequest {
                        src: paths.source.clone(),
                        dst: paths.output.clone(),
                        codec: codec.clone(),
                        crf: *crf,
                        filter: Some(filter.clone()),
                        log_path: paths.log.clone(),
                    },
                    false,
                )
            }
            LadderAction::Reencode { codec, crf } => (
                EncodeRequest {
                    src: paths.output.clone(),
                    dst: paths.tmp.clone(),
                    codec: codec.clone(),
                    crf: *crf,
                    filter: None,
                    log_path: paths.log.clone(),
                },
                true,
            ),
        };

        let mut attempt = CompressionAttempt {
            codec: request.codec.clone(),
            crf: request.crf,
            filter: request.filter.clone(),
            output_bytes: None,
        };

        if let Err(e) = self.encode(request).await {
            tracing::warn!(error = %e, crf = attempt.crf, "encode step failed");
            if reencode {
                remove_if_exists(&paths.tmp);
            }
            return (StepOutcome::Failed, attempt);
        }

        if reencode {
            if let Err(e) = std::fs::rename(&paths.tmp, &paths.output) {
                tracing::warn!(error = %e, "failed to replace artifact with re-encode");
                remove_if_exists(&paths.tmp);
                return (StepOutcome::Failed, attempt);
            }
        }

        let gate = check_file(&paths.output, self.settings.ceiling_bytes);
        attempt.output_bytes = gate.output_bytes();
        let outcome = match gate {
            SizeGateResult::Accept { .. } => StepOutcome::Fits,
            SizeGateResult::Reject { .. } => StepOutcome::TooLarge,
            SizeGateResult::Missing => StepOutcome::Failed,
        };
        (outcome, attempt)
    }

    async fn encode(&self, request: EncodeRequest) -> Result<(), EncodeError> {
        let encoder = Arc::clone(&self.encoder);
        tokio::task::spawn_blocking(move || encoder.encode(&request))
            .await
            .map_err(|e| EncodeError::Aborted(e.to_string()))?
    }

    async fn probe(&self, source: &Path) -> Option<Resolution> {
        let encoder = Arc::clone(&self.encoder);
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || encoder.probe_resolution(&source))
            .await
            .ok()
            .flatten()
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}
