//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Largest artifact the chat platform accepts: 9.9 MiB.
pub const DEFAULT_SIZE_CEILING_BYTES: u64 = (9.9 * 1024.0 * 1024.0) as u64;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP front end configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the intake server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Publicly reachable upload URL handed out to chat users
    #[serde(default)]
    pub public_url: Option<String>,
    /// Largest accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_max_upload_bytes() -> usize {
    1024 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Per-job workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    /// Directory under which every job gets its own subdirectory
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("static")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization for the encoder (0.25-1.0, default 0.75)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.75
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Primary H.264-class codec; "auto" picks the hardware encoder when present
    #[serde(default = "default_primary_codec")]
    pub primary_codec: String,
    /// Codec family used once every ladder step failed
    #[serde(default = "default_fallback_codec")]
    pub fallback_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Run the encoder under nice/ionice
    #[serde(default = "default_deprioritize")]
    pub deprioritize: bool,
    #[serde(default = "default_nice_level")]
    pub nice_level: i32,
    /// Best-effort ionice level (0 highest, 7 lowest)
    #[serde(default = "default_ionice_level")]
    pub ionice_level: u8,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_primary_codec() -> String {
    "auto".to_string()
}

fn default_fallback_codec() -> String {
    "libx265".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_audio_bitrate() -> String {
    "96k".to_string()
}

fn default_deprioritize() -> bool {
    true
}

fn default_nice_level() -> i32 {
    10
}

fn default_ionice_level() -> u8 {
    7
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            primary_codec: default_primary_codec(),
            fallback_codec: default_fallback_codec(),
            preset: default_preset(),
            audio_bitrate: default_audio_bitrate(),
            deprioritize: default_deprioritize(),
            nice_level: default_nice_level(),
            ionice_level: default_ionice_level(),
        }
    }
}

/// Compression ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LadderConfig {
    /// Maximum artifact size in bytes
    #[serde(default = "default_size_ceiling_bytes")]
    pub size_ceiling_bytes: u64,
    /// Initial CRF for most containers
    #[serde(default = "default_first_crf")]
    pub first_crf: u8,
    /// Initial CRF for `.mov` sources
    #[serde(default = "default_first_crf_mov")]
    pub first_crf_mov: u8,
    /// Escalating CRF values tried after a tier's first encode is too large
    #[serde(default = "default_crf_steps")]
    pub crf_steps: Vec<u8>,
    /// CRF used by the alternate-codec fallback
    #[serde(default = "default_fallback_crf")]
    pub fallback_crf: u8,
    #[serde(default = "default_fps_cap")]
    pub fps_cap: u32,
    /// Probe the source resolution to add a native tier
    #[serde(default = "default_probe_resolution")]
    pub probe_resolution: bool,
}

fn default_size_ceiling_bytes() -> u64 {
    DEFAULT_SIZE_CEILING_BYTES
}

fn default_first_crf() -> u8 {
    28
}

fn default_first_crf_mov() -> u8 {
    32
}

fn default_crf_steps() -> Vec<u8> {
    vec![28, 31, 34, 37, 40]
}

fn default_fallback_crf() -> u8 {
    28
}

fn default_fps_cap() -> u32 {
    30
}

fn default_probe_resolution() -> bool {
    true
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            size_ceiling_bytes: default_size_ceiling_bytes(),
            first_crf: default_first_crf(),
            first_crf_mov: default_first_crf_mov(),
            crf_steps: default_crf_steps(),
            fallback_crf: default_fallback_crf(),
            fps_cap: default_fps_cap(),
            probe_resolution: default_probe_resolution(),
        }
    }
}

/// Remote worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Base URL of the remote worker; local-only when None
    #[serde(default)]
    pub worker_url: Option<String>,
    /// Bounded wait for the handoff, in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
    /// Accepted jobs without a callback after this many seconds are failed
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
}

fn default_dispatch_timeout_ms() -> u64 {
    3000
}

fn default_callback_timeout_secs() -> u64 {
    3600
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            worker_url: None,
            timeout_ms: default_dispatch_timeout_ms(),
            callback_timeout_secs: default_callback_timeout_secs(),
        }
    }
}

/// Chat delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Total send attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_api_base(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Failure alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AlertConfig {
    /// Webhook receiving failure reports; reports are only logged when None
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub alert: AlertConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDRELAY_BIND -> server.bind
    /// - PUBLIC_URL (or TUNNEL_URL) -> server.public_url
    /// - VIDRELAY_WORKSPACE_ROOT -> workspace.root
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    /// - ENCODER_DEPRIORITIZE -> encoder.deprioritize
    /// - PC_WORKER_URL -> remote.worker_url
    /// - DISCORD_BOT_TOKEN -> delivery.bot_token
    /// - ERROR_WEBHOOK_URL -> alert.webhook_url
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDRELAY_BIND") {
            self.server.bind = val;
        }

        // PUBLIC_URL wins over the tunnel-provided TUNNEL_URL
        if let Some(val) = non_empty_var("PUBLIC_URL").or_else(|| non_empty_var("TUNNEL_URL")) {
            self.server.public_url = Some(val);
        }

        if let Some(val) = non_empty_var("VIDRELAY_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("CPU_TARGET_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }

        if let Ok(val) = env::var("ENCODER_DEPRIORITIZE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.deprioritize = true,
                "false" | "0" | "no" => self.encoder.deprioritize = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Some(val) = non_empty_var("PC_WORKER_URL") {
            self.remote.worker_url = Some(val);
        }

        if let Some(val) = non_empty_var("DISCORD_BOT_TOKEN") {
            self.delivery.bot_token = Some(val);
        }

        if let Some(val) = non_empty_var("ERROR_WEBHOOK_URL") {
            self.alert.webhook_url = Some(val);
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields defaults plus environment overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
