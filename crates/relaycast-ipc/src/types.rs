//! Common types shared by the controller, the gateway and the HTTP surface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque producer identifier, unique for the lifetime of the process.
pub type ProducerId = String;

/// Identifier of a broadcaster or viewer signalling session.
pub type SessionId = String;

/// Kind of media carried by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// SDP media type (`m=` line).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Codec negotiated for a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    /// Mime type, e.g. "video/VP8" or "audio/opus".
    pub mime_type: String,

    /// RTP clock rate in Hz.
    pub clock_rate: u32,

    /// Channel count (audio only).
    #[serde(default)]
    pub channels: Option<u16>,

    /// RTP payload type.
    pub payload_type: u8,

    /// Codec-specific format parameters (fmtp).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl CodecDescriptor {
    /// Encoding name as used in an SDP rtpmap, e.g. "VP8" for "video/VP8".
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }

    /// Media kind implied by the mime type prefix.
    pub fn kind(&self) -> Option<MediaKind> {
        let (prefix, _) = self.mime_type.split_once('/')?;
        if prefix.eq_ignore_ascii_case("audio") {
            Some(MediaKind::Audio)
        } else if prefix.eq_ignore_ascii_case("video") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    /// Whether this codec can be copied into an HLS stream that browsers play.
    pub fn is_hls_playable(&self) -> bool {
        self.encoding_name().eq_ignore_ascii_case("H264")
    }

    /// Format parameters rendered as `key=value;key=value`.
    pub fn fmtp(&self) -> Option<String> {
        if self.parameters.is_empty() {
            return None;
        }
        Some(
            self.parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";"),
        )
    }
}

/// A codec the media engine is able to consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u16>,
}

impl CodecCapability {
    /// Whether a negotiated codec matches this capability.
    pub fn matches(&self, codec: &CodecDescriptor) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && (self.channels.is_none() || codec.channels.is_none() || self.channels == codec.channels)
    }
}

/// Codec capability set of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub codecs: Vec<CodecCapability>,
}

impl RtpCapabilities {
    /// Returns true if any capability accepts the codec.
    pub fn supports(&self, codec: &CodecDescriptor) -> bool {
        self.codecs.iter().any(|c| c.matches(codec))
    }
}

/// A single inbound media stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub session_id: SessionId,
    pub kind: MediaKind,
    pub codec: CodecDescriptor,
}

/// Output topology requested from the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Layout {
    /// A single producer, no compositing filter.
    PassThrough,

    /// Two cells next to each other.
    SideBySide,

    /// Two cells on top, one centered below.
    TwoTopOneBottom,

    /// Four quadrants.
    Grid2x2,

    /// More than four cells, filled row by row.
    Grid { cells: usize },
}

/// Placement of one input on the output canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Layout {
    /// Deterministic layout for a number of composed video inputs.
    pub fn for_count(count: usize) -> Self {
        match count {
            0 | 1 => Self::PassThrough,
            2 => Self::SideBySide,
            3 => Self::TwoTopOneBottom,
            4 => Self::Grid2x2,
            n => Self::Grid { cells: n },
        }
    }

    /// Number of inputs this layout places.
    pub fn cell_count(&self) -> usize {
        match self {
            Self::PassThrough => 1,
            Self::SideBySide => 2,
            Self::TwoTopOneBottom => 3,
            Self::Grid2x2 => 4,
            Self::Grid { cells } => *cells,
        }
    }

    /// Grid dimensions as (columns, rows).
    pub fn grid(&self) -> (u32, u32) {
        match self {
            Self::PassThrough => (1, 1),
            Self::SideBySide => (2, 1),
            Self::TwoTopOneBottom | Self::Grid2x2 => (2, 2),
            Self::Grid { cells } => {
                let cells = (*cells).max(1) as u32;
                let columns = (cells as f64).sqrt().ceil() as u32;
                let rows = cells.div_ceil(columns);
                (columns, rows)
            }
        }
    }

    /// Cell placements on a canvas of the given size. Sizes are rounded down
    /// to even values so every cell is encodable as 4:2:0.
    pub fn cells(&self, width: u32, height: u32) -> Vec<Cell> {
        let (columns, rows) = self.grid();
        let cell_w = (width / columns) & !1;
        let cell_h = (height / rows) & !1;

        match self {
            Self::PassThrough => vec![Cell {
                x: 0,
                y: 0,
                width: width & !1,
                height: height & !1,
            }],
            Self::TwoTopOneBottom => vec![
                Cell { x: 0, y: 0, width: cell_w, height: cell_h },
                Cell { x: cell_w, y: 0, width: cell_w, height: cell_h },
                Cell { x: cell_w / 2, y: cell_h, width: cell_w, height: cell_h },
            ],
            _ => (0..self.cell_count() as u32)
                .map(|i| Cell {
                    x: (i % columns) * cell_w,
                    y: (i / columns) * cell_h,
                    width: cell_w,
                    height: cell_h,
                })
                .collect(),
        }
    }

    /// Returns a simple string representation of the layout.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassThrough => "pass-through",
            Self::SideBySide => "side-by-side",
            Self::TwoTopOneBottom => "two-top-one-bottom",
            Self::Grid2x2 => "grid-2x2",
            Self::Grid { .. } => "grid",
        }
    }
}

/// Where playlist, segments and status sidecar live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputTarget {
    /// Shared output directory served to viewers.
    pub dir: PathBuf,

    /// Playlist file name.
    pub playlist_name: String,

    /// Prefix of segments written by the transcoder.
    pub live_segment_prefix: String,

    /// Prefix of segments written by the fallback generator.
    pub fallback_segment_prefix: String,

    /// Status sidecar file name.
    pub status_name: String,
}

impl Default for OutputTarget {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("hls"),
            playlist_name: "index.m3u8".to_string(),
            live_segment_prefix: "live_".to_string(),
            fallback_segment_prefix: "fallback_".to_string(),
            status_name: "status.json".to_string(),
        }
    }
}

impl OutputTarget {
    /// Create a target rooted at `dir` with default naming.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(&self.playlist_name)
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(&self.status_name)
    }

    /// Segment file name pattern for one transcoder generation.
    pub fn live_segment_pattern(&self, generation: u64) -> String {
        format!("{}g{}_%05d.ts", self.live_segment_prefix, generation)
    }

    /// File name of a fallback segment, e.g. `fallback_idle.ts`.
    pub fn fallback_segment_name(&self, variant: &str) -> String {
        format!("{}{}.ts", self.fallback_segment_prefix, variant)
    }
}

/// Counters describing controller activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionMetrics {
    /// Current generation counter.
    pub generation: u64,

    /// Restart cycles started.
    pub restarts: u64,

    /// Restart cycles that reached Live.
    pub successful_starts: u64,

    /// Restart cycles that ended in Degraded.
    pub failed_starts: u64,

    /// Restart requests dropped while a cycle was in flight.
    pub coalesced_requests: u64,

    /// Unrequested transcoder exits.
    pub abnormal_exits: u64,

    /// Retries scheduled after abnormal exits.
    pub scheduled_retries: u64,

    /// Fallback playlists written.
    pub fallback_writes: u64,

    /// Producers currently composed.
    pub composed_producers: usize,

    /// Relay endpoints currently held.
    pub active_endpoints: usize,

    /// Seconds since the current process went live.
    pub live_seconds: u64,
}
