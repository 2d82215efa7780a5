//! Events emitted by the composition controller.

use serde::{Deserialize, Serialize};

use crate::state::CompositionStatus;
use crate::types::{CompositionMetrics, ProducerId};

/// Which fallback content is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    Idle,
    Degraded,
}

impl FallbackKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Degraded => "degraded",
        }
    }
}

/// How the fallback content was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// A pre-rendered slate segment was published.
    Slate,

    /// A minimal segment was synthesized.
    Synthesized,

    /// The hard-coded playlist without segments was written.
    Terminal,

    /// Nothing could be written at all.
    Failed,
}

/// Events that the controller can send to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// Controller state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<CompositionStatus>,

        /// Current state.
        current: Box<CompositionStatus>,
    },

    /// Updated controller metrics.
    Metrics(CompositionMetrics),

    /// A transcoder stderr line.
    Diagnostic { generation: u64, line: String },

    /// A producer was left out of the composition.
    ProducerExcluded {
        producer_id: ProducerId,
        reason: String,
    },

    /// Fallback content was (re)written.
    FallbackWritten {
        kind: FallbackKind,
        tier: FallbackTier,
    },

    /// Controller loop is running.
    Ready,

    /// Controller loop has exited.
    Shutdown,
}
