//! # Configuration Management
//!
//! Loads application configuration from layered sources:
//! - Built-in defaults (the `Default` impls below)
//! - `config.toml` in the working directory (optional)
//! - Environment variables with the `APP_` prefix
//! - `HOST` / `PORT` overrides used by deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_SERVER_HOST`, `APP_BRIDGE_QUEUE_CAPACITY`, ...)
//! 2. Configuration file (`config.toml`)
//! 3. Default values
//!
//! The bridge tunables deliberately default to the values the telephony
//! provider's media pacing assumes (20ms frames, 60s silence deadline);
//! change them only with a reason.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::audio::format::{AudioFormat, PIPELINE, TELEPHONY};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub audio: AudioConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tunables for the audio bridge data plane.
///
/// ## Fields:
/// - `queue_capacity`: depth of each per-session audio queue
/// - `link_queue_capacity`: depth of the per-link shock absorber between
///   wire I/O and the session queues
/// - `drop_grace_ms`: how long an enqueue may wait before the frame is
///   dropped; backpressure must never stall a live call
/// - `ws_read_deadline_s`: seconds of WebSocket silence before the link is
///   considered dead
/// - `ws_ping_interval_ms`: keepalive ping cadence on the writer side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub link_queue_capacity: usize,
    pub drop_grace_ms: u64,
    pub ws_read_deadline_s: u64,
    pub ws_ping_interval_ms: u64,
}

/// Audio formats on the two sides of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Format on the provider side (what the phone sends and expects back).
    pub telephony_format: AudioFormat,
    /// Format on the AI side. Setting this equal to `telephony_format`
    /// turns the routers into a pass-through.
    pub pipeline_format: AudioFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            bridge: BridgeConfig {
                queue_capacity: 500,
                link_queue_capacity: 100,
                drop_grace_ms: 10,
                ws_read_deadline_s: 60,
                ws_ping_interval_ms: 54,
            },
            audio: AudioConfig {
                telephony_format: TELEPHONY,
                pipeline_format: PIPELINE,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense before the server
    /// starts accepting calls.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.bridge.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Session queue capacity must be greater than 0"));
        }

        if self.bridge.link_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Link queue capacity must be greater than 0"));
        }

        if self.bridge.drop_grace_ms == 0 {
            return Err(anyhow::anyhow!("Drop grace must be greater than 0 ms"));
        }

        if self.bridge.ws_read_deadline_s == 0 {
            return Err(anyhow::anyhow!("WebSocket read deadline must be greater than 0 s"));
        }

        let deadline_ms = self.bridge.ws_read_deadline_s * 1000;
        if self.bridge.ws_ping_interval_ms == 0 || self.bridge.ws_ping_interval_ms >= deadline_ms {
            return Err(anyhow::anyhow!(
                "Ping interval must be positive and shorter than the read deadline"
            ));
        }

        if !self.audio.telephony_format.is_valid() {
            return Err(anyhow::anyhow!(
                "Invalid telephony audio format: {}",
                self.audio.telephony_format
            ));
        }

        if !self.audio.pipeline_format.is_valid() {
            return Err(anyhow::anyhow!(
                "Invalid pipeline audio format: {}",
                self.audio.pipeline_format
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bridge.queue_capacity, 500);
        assert_eq!(config.bridge.link_queue_capacity, 100);
        assert_eq!(config.bridge.drop_grace_ms, 10);
        assert_eq!(config.audio.telephony_format, TELEPHONY);
        assert_eq!(config.audio.pipeline_format, PIPELINE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.ws_ping_interval_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.pipeline_format.channels = 5;
        assert!(config.validate().is_err());
    }
}
