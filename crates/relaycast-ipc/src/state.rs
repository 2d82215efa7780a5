//! Composition state machine types.

use serde::{Deserialize, Serialize};

use crate::types::{Layout, ProducerId};

/// The current state of the composition controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CompositionStatus {
    /// No producers, idle fallback content showing.
    #[default]
    Idle,

    /// A restart cycle is in flight.
    Starting {
        /// Generation the cycle runs under.
        generation: u64,

        /// Current restart phase.
        phase: RestartPhase,
    },

    /// The transcoder is running and believed healthy.
    Live {
        /// Generation of the running process.
        generation: u64,

        /// Requested output topology.
        layout: Layout,

        /// Producers composed into the output.
        producers: Vec<ProducerId>,
    },

    /// The pipeline is down while producers are still present.
    Degraded {
        /// Generation that failed.
        generation: u64,

        /// Why the pipeline is down.
        reason: DegradedReason,
    },
}

impl CompositionStatus {
    /// Returns true if the controller is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if a restart cycle is in flight.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    /// Returns true if the transcoder is live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Returns true if the pipeline is degraded.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Generation the state refers to, if any.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Starting { generation, .. }
            | Self::Live { generation, .. }
            | Self::Degraded { generation, .. } => Some(*generation),
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting { .. } => "Starting",
            Self::Live { .. } => "Live",
            Self::Degraded { .. } => "Degraded",
        }
    }
}

/// Steps of one restart cycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPhase {
    /// Stopping the old process, releasing and allocating endpoints.
    AllocateEndpoints,

    /// Writing one input descriptor per endpoint.
    WriteDescriptors,

    /// Spawning the transcoder.
    SpawnProcess,

    /// Waiting for the transcoder to report output.
    AwaitStart,

    /// Connecting bridging transports to the transcoder ports.
    BindPorts,

    /// Resuming paused consumers.
    ResumeConsumers,

    /// Asking video producers for a key frame.
    RequestKeyFrames,
}

impl RestartPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AllocateEndpoints => Some(Self::WriteDescriptors),
            Self::WriteDescriptors => Some(Self::SpawnProcess),
            Self::SpawnProcess => Some(Self::AwaitStart),
            Self::AwaitStart => Some(Self::BindPorts),
            Self::BindPorts => Some(Self::ResumeConsumers),
            Self::ResumeConsumers => Some(Self::RequestKeyFrames),
            Self::RequestKeyFrames => None,
        }
    }

    /// Returns the previous phase, if any.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::AllocateEndpoints => None,
            Self::WriteDescriptors => Some(Self::AllocateEndpoints),
            Self::SpawnProcess => Some(Self::WriteDescriptors),
            Self::AwaitStart => Some(Self::SpawnProcess),
            Self::BindPorts => Some(Self::AwaitStart),
            Self::ResumeConsumers => Some(Self::BindPorts),
            Self::RequestKeyFrames => Some(Self::ResumeConsumers),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::AllocateEndpoints => "Allocating relay endpoints",
            Self::WriteDescriptors => "Writing input descriptors",
            Self::SpawnProcess => "Spawning transcoder",
            Self::AwaitStart => "Waiting for transcoder output",
            Self::BindPorts => "Connecting relay ports",
            Self::ResumeConsumers => "Resuming consumers",
            Self::RequestKeyFrames => "Requesting key frames",
        }
    }
}

/// Reason the pipeline is degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedReason {
    /// The transcoder failed to start or confirm readiness.
    StartFailed { phase: RestartPhase, message: String },

    /// No bridging transport or port could be allocated.
    TransportUnavailable { message: String },

    /// The transcoder exited while live.
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The supervisor lost track of the process.
    FatalError { message: String },

    /// A composed endpoint disappeared while live.
    EndpointLost { producer_id: ProducerId },

    /// Output was cleared on request.
    OutputCleared,
}

impl DegradedReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::StartFailed { phase, message } => {
                format!("Transcoder start failed ({}): {message}", phase.name())
            }
            Self::TransportUnavailable { message } => format!("Relay unavailable: {message}"),
            Self::AbnormalExit { code, signal } => match (code, signal) {
                (Some(code), _) => format!("Transcoder exited with code {code}"),
                (None, Some(signal)) => format!("Transcoder killed by signal {signal}"),
                (None, None) => "Transcoder exited".to_string(),
            },
            Self::FatalError { message } => format!("Transcoder error: {message}"),
            Self::EndpointLost { producer_id } => format!("Producer {producer_id} disappeared"),
            Self::OutputCleared => "Output cleared".to_string(),
        }
    }

    /// Whether an automatic retry should be scheduled.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AbnormalExit { .. } | Self::FatalError { .. } | Self::EndpointLost { .. }
        )
    }
}
