//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides,
//! then handed to `session-relay-core`'s own [`Config`] once validated.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use session_relay_core::config::Config as CoreConfig;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP port for the audio data plane.
    /// Override: `RELAY_UDP_PORT`
    pub udp_port: u16,

    /// Target adaptive jitter buffer size in milliseconds.
    /// Override: `RELAY_JITTER_TARGET_MS`
    pub jitter_target_ms: u64,
    /// Minimum jitter buffer clamp.
    pub jitter_min_ms: u64,
    /// Maximum jitter buffer clamp.
    pub jitter_max_ms: u64,
    /// Whether the jitter buffer adapts its target over time.
    pub jitter_adaptive: bool,

    /// Idle session timeout in milliseconds.
    /// Override: `RELAY_SESSION_TIMEOUT_MS`
    pub session_timeout_ms: u64,
    /// Interval between idle-session sweeps.
    pub session_cleanup_interval_ms: u64,

    /// Per-session memory cap in bytes.
    pub memory_per_session_bytes: u64,
    /// Process-wide memory cap in bytes.
    pub memory_total_bytes: u64,

    /// Default subtitle duration when a record has no explicit end time.
    pub subtitle_default_duration_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            udp_port: core.udp_port,
            jitter_target_ms: core.jitter.target_ms,
            jitter_min_ms: core.jitter.min_ms,
            jitter_max_ms: core.jitter.max_ms,
            jitter_adaptive: core.jitter.adaptive,
            session_timeout_ms: core.session.timeout_ms,
            session_cleanup_interval_ms: core.session.cleanup_interval_ms,
            memory_per_session_bytes: core.memory.per_session_bytes,
            memory_total_bytes: core.memory.total_bytes,
            subtitle_default_duration_ms: core.subtitles.default_duration_ms,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RELAY_UDP_PORT") {
            if let Ok(port) = val.parse() {
                self.udp_port = port;
            }
        }
        if let Ok(val) = std::env::var("RELAY_JITTER_TARGET_MS") {
            if let Ok(ms) = val.parse() {
                self.jitter_target_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("RELAY_SESSION_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.session_timeout_ms = ms;
            }
        }
    }

    /// Converts to session-relay-core's validated `Config` type.
    pub fn to_core_config(&self) -> CoreConfig {
        let mut core = CoreConfig::default();
        core.udp_port = self.udp_port;
        core.jitter.target_ms = self.jitter_target_ms;
        core.jitter.min_ms = self.jitter_min_ms;
        core.jitter.max_ms = self.jitter_max_ms;
        core.jitter.adaptive = self.jitter_adaptive;
        core.session.timeout_ms = self.session_timeout_ms;
        core.session.cleanup_interval_ms = self.session_cleanup_interval_ms;
        core.memory.per_session_bytes = self.memory_per_session_bytes;
        core.memory.total_bytes = self.memory_total_bytes;
        core.subtitles.default_duration_ms = self.subtitle_default_duration_ms;
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_core_config() {
        let config = ServerConfig::default();
        let core = config.to_core_config();
        assert!(core.validate().is_ok());
        assert_eq!(core.udp_port, config.udp_port);
    }
}
