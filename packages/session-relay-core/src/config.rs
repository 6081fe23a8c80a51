//! Validated runtime configuration for the library.
//!
//! Constructed once at startup and read by value thereafter - it never
//! changes once the pipeline is running, mirroring the host project's
//! validate-then-freeze config pattern.

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::jitter::JitterConfig;
use crate::protocol_constants::{
    DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_MAX_BUFFER_MS, DEFAULT_MIN_BUFFER_MS,
    DEFAULT_PER_SESSION_MEMORY_BYTES, DEFAULT_SESSION_TIMEOUT_MS, DEFAULT_SUBTITLE_DURATION_MS,
    DEFAULT_TARGET_BUFFER_MS, DEFAULT_TOTAL_MEMORY_BYTES, DEFAULT_UDP_PORT,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterSettings {
    pub target_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub adaptive: bool,
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self {
            target_ms: DEFAULT_TARGET_BUFFER_MS,
            min_ms: DEFAULT_MIN_BUFFER_MS,
            max_ms: DEFAULT_MAX_BUFFER_MS,
            adaptive: true,
        }
    }
}

impl JitterSettings {
    fn validate(&self) -> RelayResult<()> {
        if self.min_ms > self.max_ms {
            return Err(RelayError::InvalidConfig(format!(
                "jitter.min_ms ({}) exceeds jitter.max_ms ({})",
                self.min_ms, self.max_ms
            )));
        }
        if self.target_ms < self.min_ms || self.target_ms > self.max_ms {
            return Err(RelayError::InvalidConfig(format!(
                "jitter.target_ms ({}) must lie within [{}, {}]",
                self.target_ms, self.min_ms, self.max_ms
            )));
        }
        Ok(())
    }

    pub fn to_jitter_config(&self) -> JitterConfig {
        JitterConfig {
            target_buffer_ms: self.target_ms,
            min_buffer_ms: self.min_ms,
            max_buffer_ms: self.max_ms,
            adaptive: self.adaptive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub timeout_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub per_session_bytes: u64,
    pub total_bytes: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            per_session_bytes: DEFAULT_PER_SESSION_MEMORY_BYTES,
            total_bytes: DEFAULT_TOTAL_MEMORY_BYTES,
        }
    }
}

impl MemorySettings {
    fn validate(&self) -> RelayResult<()> {
        if self.per_session_bytes > self.total_bytes {
            return Err(RelayError::InvalidConfig(format!(
                "memory.per_session_bytes ({}) exceeds memory.total_bytes ({})",
                self.per_session_bytes, self.total_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleSettings {
    pub default_duration_ms: u64,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            default_duration_ms: DEFAULT_SUBTITLE_DURATION_MS,
        }
    }
}

/// Top-level, validated library configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub udp_port: u16,
    pub jitter: JitterSettings,
    pub session: SessionSettings,
    pub memory: MemorySettings,
    pub subtitles: SubtitleSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            jitter: JitterSettings::default(),
            session: SessionSettings::default(),
            memory: MemorySettings::default(),
            subtitles: SubtitleSettings::default(),
        }
    }
}

impl Config {
    /// Validates cross-field invariants. Called once at startup; the
    /// bootstrap composition root refuses to wire services against a
    /// config that fails this.
    pub fn validate(&self) -> RelayResult<()> {
        self.jitter.validate()?;
        self.memory.validate()?;
        if self.udp_port == 0 {
            return Err(RelayError::InvalidConfig(
                "udp_port must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
