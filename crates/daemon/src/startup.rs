//! Startup checks module for vidrelay
//!
//! Provides preflight checks before the daemon accepts uploads:
//! - ffmpeg and ffprobe availability
//! - Encoder discovery and primary H.264 codec selection
//!
//! The primary codec is `h264_v4l2m2m` when ffmpeg lists it (the Raspberry Pi hardware
//! encoder) and `libx264` otherwise, unless the configuration names one explicitly.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;

/// Hardware H.264 encoder preferred when available
pub const HARDWARE_H264_ENCODER: &str = "h264_v4l2m2m";

/// Software H.264 encoder used when no hardware encoder is listed
pub const SOFTWARE_H264_ENCODER: &str = "libx264";

/// Substrings identifying hardware-backed ffmpeg encoders
const HARDWARE_ENCODER_MARKERS: &[&str] = &["v4l2m2m", "nvenc", "qsv", "vaapi", "amf", "omx", "videotoolbox"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("FFprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("Could not list ffmpeg encoders: {0}")]
    EncoderList(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful preflight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub ffmpeg_version: Option<u32>,
    pub primary_codec: String,
    pub hardware: bool,
}

/// Whether an ffmpeg encoder name denotes a hardware encoder
pub fn is_hardware_encoder(name: &str) -> bool {
    let lower = name.to_lowercase();
    HARDWARE_ENCODER_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.0 ..."
/// - N-prefixed: "ffmpeg version n6.0-... ..."
/// - Distribution builds: "ffmpeg version 5.1.6-0+deb12u1+rpt1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Parse `ffmpeg -hide_banner -encoders` output into encoder names
///
/// The listing starts after a ` ------` separator; each entry is `<flags> <name> <description>`.
pub fn parse_encoder_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| line.trim() != "------")
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _flags = fields.next()?;
            fields.next().map(str::to_string)
        })
        .collect()
}

/// Resolve the primary codec
///
/// An explicit `configured` value wins; `"auto"` picks the hardware encoder if listed.
pub fn select_primary_codec(configured: &str, available: &[String]) -> String {
    if !configured.eq_ignore_ascii_case("auto") {
        return configured.to_string();
    }
    if available.iter().any(|e| e == HARDWARE_H264_ENCODER) {
        HARDWARE_H264_ENCODER.to_string()
    } else {
        SOFTWARE_H264_ENCODER.to_string()
    }
}

/// Run `<ffmpeg> -version` and return its major version, if parseable.
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
                ffmpeg_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg_path, output.status
        )));
    }

    Ok(parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Run `<ffprobe> -version`.
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<(), StartupError> {
    let output = Command::new(ffprobe_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfprobeUnavailable(format!(
                "{} -version failed; is ffprobe installed and in PATH? Error: {}",
                ffprobe_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version exited with {}",
            ffprobe_path, output.status
        )));
    }
    Ok(())
}

/// Encoders compiled into the ffmpeg binary
pub fn list_encoders(ffmpeg_path: &str) -> Result<Vec<String>, StartupError> {
    let output = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| StartupError::EncoderList(e.to_string()))?;

    if !output.status.success() {
        return Err(StartupError::EncoderList(format!(
            "{} -encoders exited with {}",
            ffmpeg_path, output.status
        )));
    }
    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Primary codec when startup checks are skipped: no probing, `auto` means software.
pub fn primary_codec_without_checks(cfg: &Config) -> String {
    select_primary_codec(&cfg.encoder.primary_codec, &[])
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability
/// 2. ffprobe availability (only when resolution probing is enabled)
/// 3. Encoder listing and codec selection
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    let ffmpeg_version = check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    if cfg.ladder.probe_resolution {
        check_ffprobe_available(&cfg.encoder.ffprobe_path)?;
    }

    let encoders = list_encoders(&cfg.encoder.ffmpeg_path)?;
    let primary_codec = select_primary_codec(&cfg.encoder.primary_codec, &encoders);

    for codec in [&primary_codec, &cfg.encoder.fallback_codec] {
        if !encoders.iter().any(|e| e == codec) {
            tracing::warn!(codec = %codec, "configured encoder not listed by ffmpeg");
        }
    }

    let report = StartupReport {
        ffmpeg_version,
        hardware: is_hardware_encoder(&primary_codec),
        primary_codec,
    };
    tracing::info!(
        ffmpeg_version = ?report.ffmpeg_version,
        primary_codec = %report.primary_codec,
        hardware = report.hardware,
        fallback_codec = %cfg.encoder.fallback_codec,
        "startup checks passed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENCODERS_OUTPUT: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
 V....D h264_v4l2m2m         V4L2 mem2mem H.264 encoder wrapper (codec h264)
 V....D libx265              libx265 H.265 / HEVC (codec hevc)
 A....D aac                  AAC (Advanced Audio Coding)
";

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_explicit_codec_always_wins(
            codec in "[a-z0-9_]{1,16}".prop_filter("not auto", |s| s != "auto"),
            list_hw in any::<bool>(),
        ) {
            let available = if list_hw {
                vec![HARDWARE_H264_ENCODER.to_string()]
            } else {
                vec![]
            };
            prop_assert_eq!(select_primary_codec(&codec, &available), codec);
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_debian_build() {
        let output = "ffmpeg version 5.1.6-0+deb12u1+rpt1 Copyright (c) 2000-2024";
        assert_eq!(parse_ffmpeg_version(output), Some(5));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(ENCODERS_OUTPUT);
        assert_eq!(encoders, vec!["libx264", "h264_v4l2m2m", "libx265", "aac"]);
    }

    #[test]
    fn test_parse_encoder_list_without_separator() {
        assert!(parse_encoder_list("garbage\nmore garbage").is_empty());
    }

    #[test]
    fn test_auto_prefers_hardware_encoder() {
        let encoders = parse_encoder_list(ENCODERS_OUTPUT);
        assert_eq!(select_primary_codec("auto", &encoders), "h264_v4l2m2m");
    }

    #[test]
    fn test_auto_without_hardware_uses_libx264() {
        let encoders = vec!["libx264".to_string(), "libx265".to_string()];
        assert_eq!(select_primary_codec("auto", &encoders), "libx264");
        assert_eq!(select_primary_codec("AUTO", &[]), "libx264");
    }

    #[test]
    fn test_primary_codec_without_checks() {
        let mut cfg = Config::default();
        assert_eq!(primary_codec_without_checks(&cfg), "libx264");
        cfg.encoder.primary_codec = "h264_v4l2m2m".into();
        assert_eq!(primary_codec_without_checks(&cfg), "h264_v4l2m2m");
    }

    #[test]
    fn test_is_hardware_encoder() {
        assert!(is_hardware_encoder("h264_v4l2m2m"));
        assert!(is_hardware_encoder("hevc_NVENC"));
        assert!(!is_hardware_encoder("libx264"));
        assert!(!is_hardware_encoder("libx265"));
    }

    #[test]
    fn test_missing_ffmpeg_is_reported() {
        let err = check_ffmpeg_available("/nonexistent/ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::FfmpegUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/ffmpeg"));
    }

    #[test]
    fn test_missing_ffprobe_is_reported() {
        let err = check_ffprobe_available("/nonexistent/ffprobe").unwrap_err();
        assert!(matches!(err, StartupError::FfprobeUnavailable(_)));
    }
}
