//! Transcoder process supervision.
//!
//! This crate builds the transcoder command line for a composition request
//! and owns the transcoder OS process: spawning, readiness confirmation,
//! graceful and forced termination, and exit reporting.

mod args;
mod error;
mod process;
mod supervisor;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use args::{build_args, select_layout, ARGS_VERSION};
pub use error::TranscoderError;
pub use process::{ChildProcess, CommandSpawner, ExitInfo, ProcessSpawner, SpawnedProcess};
pub use supervisor::{ProcessInfo, SupervisorEvent, TranscodeSupervisor};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relaycast_ipc::{CodecDescriptor, MediaKind, OutputTarget, ProducerId};

/// Result type for transcoder operations.
pub type TranscoderResult<T> = Result<T, TranscoderError>;

/// Capacity of the stderr line channel.
pub const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 256;

/// Video handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStrategy {
    /// Always copy the single input's bitstream.
    Copy,

    /// Always re-encode to H.264.
    Reencode,

    /// Copy only when the single input is already browser-playable.
    Auto,
}

/// Transcoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Transcoder executable.
    pub program: PathBuf,

    /// Directory input descriptors are written to.
    pub work_dir: PathBuf,

    /// Copy vs re-encode policy.
    pub video: VideoStrategy,

    /// Output canvas width for composited layouts.
    pub width: u32,

    /// Output canvas height for composited layouts.
    pub height: u32,

    /// Output frame rate.
    pub framerate: u32,

    /// Video bitrate in kbps.
    pub video_bitrate_kbps: u32,

    /// Audio bitrate in kbps.
    pub audio_bitrate_kbps: u32,

    /// x264 preset.
    pub preset: String,

    /// Target segment duration in seconds.
    pub segment_secs: u32,

    /// Segments kept in the live playlist.
    pub list_size: u32,

    /// Stderr substring that marks the process as producing output.
    pub ready_pattern: String,

    /// Bound on spawn-to-ready.
    pub start_timeout_ms: u64,

    /// Time allowed for a graceful exit before killing.
    pub stop_grace_ms: u64,

    /// Time allowed for the exit after a kill.
    pub kill_timeout_ms: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            work_dir: std::env::temp_dir().join("relaycast"),
            video: VideoStrategy::Auto,
            width: 1280,
            height: 720,
            framerate: 30,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            preset: "veryfast".to_string(),
            segment_secs: 2,
            list_size: 6,
            ready_pattern: "Output #0".to_string(),
            start_timeout_ms: 10_000,
            stop_grace_ms: 3_000,
            kill_timeout_ms: 2_000,
        }
    }
}

impl TranscodeConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// One transcoder input.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub codec: CodecDescriptor,
    /// Path of the SDP descriptor for this input.
    pub descriptor: PathBuf,
}

/// Everything needed to start one transcoder generation.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub generation: u64,
    pub inputs: Vec<InputSpec>,
    pub output: OutputTarget,
}
