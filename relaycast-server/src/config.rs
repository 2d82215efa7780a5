//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use relaycast_engine::ControllerConfig;
use relaycast_transport::{RelayConfig, UdpRelayConfig};

/// Environment variable prefix, e.g. `RELAYCAST_CONTROLLER__CONFIRM_DELAY_MS`.
pub const ENV_PREFIX: &str = "RELAYCAST";

/// Top-level configuration of the relaycast server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,

    /// Composition controller settings.
    pub controller: ControllerConfig,

    /// Endpoints between the media engine and the transcoder.
    pub relay: RelayConfig,

    /// Plain-RTP ingest engine.
    pub udp: UdpRelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            controller: ControllerConfig::default(),
            relay: RelayConfig::default(),
            udp: UdpRelayConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration in priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file, if given
    /// 3. Defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
