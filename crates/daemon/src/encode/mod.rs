//! Encoding modules for vidrelay
//!
//! The [`Encoder`] trait is the seam between the compression ladder and the external
//! transcoder. Both methods block, so callers run them on the blocking pool.

pub mod ffmpeg;
pub mod probe;

use std::path::Path;

pub use ffmpeg::{build_ffmpeg_command, run_ffmpeg, EncodeError, EncodeRequest, EncoderSettings, FfmpegEncoder};
pub use probe::{parse_ffprobe_resolution, probe_resolution, ProbeError, Resolution};

/// A single-shot transcoder.
pub trait Encoder: Send + Sync {
    /// Run one encode, blocking until the external process exits.
    fn encode(&self, request: &EncodeRequest) -> Result<(), EncodeError>;

    /// Resolution of the first video stream, if it can be determined.
    fn probe_resolution(&self, _src: &Path) -> Option<Resolution> {
        None
    }
}
