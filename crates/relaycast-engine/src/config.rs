//! Controller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relaycast_fallback::FallbackConfig;
use relaycast_ipc::OutputTarget;
use relaycast_transcoder::TranscodeConfig;
use relaycast_transport::RetryPolicy;

/// Composition controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Output directory and naming.
    pub output: OutputTarget,

    /// Transcoder settings.
    pub transcoder: TranscodeConfig,

    /// Fallback content settings.
    pub fallback: FallbackConfig,

    /// Wait between start confirmation and connecting ports, letting the
    /// transcoder bind its inputs.
    pub confirm_delay_ms: u64,

    /// Bound on each connect, resume and key frame request.
    pub step_timeout_ms: u64,

    /// Backoff and budget for automatic restarts after abnormal exits.
    pub retry: RetryPolicy,

    /// A live period at least this long resets the retry budget.
    pub stable_live_ms: u64,

    /// Metrics emission interval while live.
    pub metrics_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            output: OutputTarget::default(),
            transcoder: TranscodeConfig::default(),
            fallback: FallbackConfig::default(),
            confirm_delay_ms: 1_000,
            step_timeout_ms: 2_000,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 2_000,
                max_delay_ms: 30_000,
            },
            stable_live_ms: 30_000,
            metrics_interval_ms: 1_000,
        }
    }
}

impl ControllerConfig {
    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn stable_live(&self) -> Duration {
        Duration::from_millis(self.stable_live_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }
}
