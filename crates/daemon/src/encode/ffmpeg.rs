//! FFmpeg encoder module for vidrelay
//!
//! Provides functionality to build and execute a single deprioritized FFmpeg
//! transcode with the upload-friendly settings used by every ladder step.

use super::probe::{probe_resolution, Resolution};
use super::Encoder;
use crate::concurrency::ResourcePlan;
use crate::config::Config;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder exited with non-zero status (or was killed by a signal)
    #[error("encoder exited with code {exit_code:?} (log: {log_path:?})")]
    ProcessFailed {
        exit_code: Option<i32>,
        log_path: Option<PathBuf>,
    },

    /// The encode task itself died before reporting
    #[error("encode task aborted: {0}")]
    Aborted(String),

    /// IO error starting the encoder or opening its log
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub codec: String,
    pub crf: u8,
    /// `-vf` filter graph (scale and frame-rate cap)
    pub filter: Option<String>,
    /// Combined stdout/stderr destination; discarded when None
    pub log_path: Option<PathBuf>,
}

/// Settings shared by every invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub ffmpeg_path: String,
    pub preset: String,
    pub audio_bitrate: String,
    pub resources: ResourcePlan,
}

impl EncoderSettings {
    pub fn from_config(cfg: &Config, resources: ResourcePlan) -> Self {
        Self {
            ffmpeg_path: cfg.encoder.ffmpeg_path.clone(),
            preset: cfg.encoder.preset.clone(),
            audio_bitrate: cfg.encoder.audio_bitrate.clone(),
            resources,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            preset: "ultrafast".to_string(),
            audio_bitrate: "96k".to_string(),
            resources: ResourcePlan::default(),
        }
    }
}

/// Build the FFmpeg command for one request
///
/// Creates a Command configured with:
/// - nice/ionice wrapping when the resource plan asks for it
/// - generous probing so odd phone containers are read correctly
/// - the first video stream and optional first audio stream only
/// - faststart MP4, the requested codec/CRF, AAC audio
/// - the optional filter graph, then the output path
pub fn build_ffmpeg_command(request: &EncodeRequest, settings: &EncoderSettings) -> Command {
    let plan = &settings.resources;
    let mut cmd = if plan.deprioritize {
        let mut cmd = Command::new("nice");
        cmd.arg("-n").arg(plan.nice_level.to_string());
        cmd.arg("ionice")
            .arg("-c2")
            .arg(format!("-n{}", plan.ionice_level));
        cmd.arg(&settings.ffmpeg_path);
        cmd
    } else {
        Command::new(&settings.ffmpeg_path)
    };

    cmd.args(["-hide_banner", "-y"]);
    cmd.args(["-analyzeduration", "100M", "-probesize", "100M"]);
    cmd.arg("-i").arg(&request.src);

    // Unknown data streams (phone telemetry, timecode) break muxing into MP4
    cmd.args(["-map", "0:v:0", "-map", "0:a:0?", "-ignore_unknown"]);
    cmd.args(["-movflags", "faststart"]);

    cmd.arg("-vcodec").arg(&request.codec);
    cmd.arg("-crf").arg(request.crf.to_string());
    cmd.arg("-preset").arg(&settings.preset);
    cmd.arg("-acodec").arg("aac");
    cmd.arg("-b:a").arg(&settings.audio_bitrate);
    cmd.arg("-threads").arg(plan.encoder_threads.to_string());

    if let Some(filter) = &request.filter {
        cmd.arg("-vf").arg(filter);
    }

    cmd.arg(&request.dst);
    cmd
}

/// Execute one FFmpeg encode
///
/// Output is appended to `log_path` so the log of a whole ladder run survives for
/// failure reports.
///
/// # Errors
/// - `Io` if the log cannot be opened or the process fails to start
/// - `ProcessFailed` if the process exits non-zero or is terminated by a signal
pub fn run_ffmpeg(request: &EncodeRequest, settings: &EncoderSettings) -> Result<(), EncodeError> {
    let mut cmd = build_ffmpeg_command(request, settings);
    cmd.stdin(Stdio::null());

    match &request.log_path {
        Some(path) => {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            cmd.stdout(Stdio::from(log.try_clone()?));
            cmd.stderr(Stdio::from(log));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }

    let status = cmd.status()?;

    if status.success() {
        Ok(())
    } else {
        Err(EncodeError::ProcessFailed {
            exit_code: status.code(),
            log_path: request.log_path.clone(),
        })
    }
}

/// Production [`Encoder`] backed by the ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    settings: EncoderSettings,
    ffprobe_path: String,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings, ffprobe_path: impl Into<String>) -> Self {
        Self {
            settings,
            ffprobe_path: ffprobe_path.into(),
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError> {
        run_ffmpeg(request, &self.settings)
    }

    fn probe_resolution(&self, src: &Path) -> Option<Resolution> {
        match probe_resolution(&self.ffprobe_path, src) {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "resolution probe failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("[a-zA-Z0-9_/.-]{1,50}")
            .unwrap()
            .prop_filter("non-empty path", |s| !s.is_empty())
    }

    fn request(src: &str, dst: &str, crf: u8, filter: Option<&str>) -> EncodeRequest {
        EncodeRequest {
            src: PathBuf::from(src),
            dst: PathBuf::from(dst),
            codec: "libx264".to_string(),
            crf,
            filter: filter.map(String::from),
            log_path: None,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            src in path_strategy(),
            dst in path_strategy(),
            crf in 0u8..52,
            threads in 1u32..64,
        ) {
            let settings = EncoderSettings {
                resources: ResourcePlan { encoder_threads: threads, ..ResourcePlan::default() },
                ..EncoderSettings::default()
            };
            let cmd = build_ffmpeg_command(&request(&src, &dst, crf, None), &settings);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.get_program(), OsStr::new("nice"));
            prop_assert!(has_flag_with_value(&args, "-i", &src), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-crf", &crf.to_string()), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-vcodec", "libx264"), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-threads", &threads.to_string()), "args: {:?}", args);
            prop_assert_eq!(args.last().map(String::as_str), Some(dst.as_str()));
            prop_assert!(!args.iter().any(|a| a == "-vf"));
        }
    }

    #[test]
    fn test_deprioritized_prefix() {
        let cmd = build_ffmpeg_command(&request("in.mov", "out.mp4", 32, None), &EncoderSettings::default());
        let args = get_command_args(&cmd);

        assert_eq!(&args[..6], &["-n", "10", "ionice", "-c2", "-n7", "ffmpeg"]);
    }

    #[test]
    fn test_without_deprioritization_runs_ffmpeg_directly() {
        let settings = EncoderSettings {
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            resources: ResourcePlan {
                deprioritize: false,
                ..ResourcePlan::default()
            },
            ..EncoderSettings::default()
        };
        let cmd = build_ffmpeg_command(&request("in.mp4", "out.mp4", 28, None), &settings);
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("/usr/bin/ffmpeg"));
        assert!(!args.iter().any(|a| a == "ionice"));
    }

    #[test]
    fn test_stream_mapping_and_audio() {
        let cmd = build_ffmpeg_command(
            &request("in.mp4", "out.mp4", 28, Some("scale='min(iw,1920)':'min(ih,1080)',fps=30")),
            &EncoderSettings::default(),
        );
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-map", "0:v:0"));
        assert!(has_flag_with_value(&args, "-map", "0:a:0?"));
        assert!(has_flag_with_value(&args, "-movflags", "faststart"));
        assert!(has_flag_with_value(&args, "-acodec", "aac"));
        assert!(has_flag_with_value(&args, "-b:a", "96k"));
        assert!(has_flag_with_value(&args, "-preset", "ultrafast"));
        assert!(has_flag_with_value(
            &args,
            "-vf",
            "scale='min(iw,1920)':'min(ih,1080)',fps=30"
        ));
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let settings = EncoderSettings {
            ffmpeg_path: "/nonexistent/vidrelay-ffmpeg".to_string(),
            resources: ResourcePlan {
                deprioritize: false,
                ..ResourcePlan::default()
            },
            ..EncoderSettings::default()
        };
        let result = run_ffmpeg(&request("in.mp4", "out.mp4", 28, None), &settings);
        assert!(matches!(result, Err(EncodeError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_process_failed_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("error.log");
        // `false` ignores its arguments and exits 1
        let settings = EncoderSettings {
            ffmpeg_path: "false".to_string(),
            resources: ResourcePlan {
                deprioritize: false,
                ..ResourcePlan::default()
            },
            ..EncoderSettings::default()
        };
        let mut req = request("in.mp4", "out.mp4", 28, None);
        req.log_path = Some(log_path.clone());

        match run_ffmpeg(&req, &settings) {
            Err(EncodeError::ProcessFailed { exit_code, log_path: logged }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(logged, Some(log_path.clone()));
            }
            other => panic!("expected ProcessFailed, got {:?}", other),
        }
        assert!(log_path.exists());
    }
}
