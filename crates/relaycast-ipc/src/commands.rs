//! Commands sent to the composition controller.

use serde::{Deserialize, Serialize};

/// Commands that the gateway and the HTTP surface can send to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerCommand {
    /// The producer registry was mutated; re-read it.
    ProducersChanged,

    /// Force a composition restart (also retries out of Degraded).
    Restart,

    /// Stop the current writer, wipe the output and show idle content.
    ClearOutput,

    /// Request current controller state.
    GetState,

    /// Stop everything and exit the controller loop.
    Shutdown,
}
