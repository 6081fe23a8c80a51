//! Fixed protocol constants and tunable configuration defaults.
//!
//! The first group is defined by the wire format and must never change
//! without a protocol version bump. The second group are the default
//! values for options the embedder may override via [`crate::config::Config`].

// ─────────────────────────────────────────────────────────────────────────────
// Wire format (fixed)
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum datagram header size in bytes, excluding the variable-length
/// session id: `u32 seq | u64 tts_ts | u64 playback_ts | u8 fmt | u32 sample_rate
/// | u8 is_last | u32 payload_len` = 4+8+8+1+4+1+4, plus the leading `u8 sid_len`.
pub const WIRE_HEADER_MIN_BYTES: usize = 1 + 4 + 8 + 8 + 1 + 4 + 1 + 4;

/// Maximum session id length in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Format tag: PCM.
pub const FORMAT_TAG_PCM: u8 = 0;
/// Format tag: MP3.
pub const FORMAT_TAG_MP3: u8 = 1;
/// Format tag: Opus.
pub const FORMAT_TAG_OPUS: u8 = 2;

/// Scratch buffer size for a single `recv_from` call. Comfortably above
/// any realistic single audio datagram so a read never has to be split.
pub const RECV_BUFFER_BYTES: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Sync engine defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Smoothness margin added to the local baseline instant.
pub const PREBUFFER_MS: u64 = 50;

/// Default one-way network latency assumed before any measurement exists.
pub const DEFAULT_NETWORK_LATENCY_MS: u64 = 20;

/// Floor applied to the measured or default network latency.
pub const MIN_NETWORK_LATENCY_MS: u64 = 5;

/// Deadlines are never scheduled closer than this to "now".
pub const MIN_SCHEDULE_AHEAD_MS: u64 = 5;

/// Per-packet jitter compensation cap.
pub const MAX_JITTER_COMP_MS: u64 = 20;

/// Smoothing constant for the jitter EMA.
pub const JITTER_SMOOTHING_ALPHA: f64 = 0.1;

/// Drift beyond which the sync engine applies a slew correction.
pub const SLEW_TRIGGER_DRIFT_MS: i64 = 10;

/// Fraction of the observed drift applied per slew adjustment.
pub const SLEW_FRACTION: f64 = 0.1;

/// Drift beyond which slew is abandoned and only reported (recovery is
/// the control plane's decision).
pub const MAX_AUTO_CORRECT_DRIFT_MS: i64 = 100;

/// Fallback chunk duration for compressed formats with no prior packet
/// to derive an inter-packet delta from.
pub const DEFAULT_CHUNK_DURATION_MS: u64 = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Jitter buffer defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default UDP bind port for the data plane.
pub const DEFAULT_UDP_PORT: u16 = 8001;

/// Default adaptive buffer target (ms).
pub const DEFAULT_TARGET_BUFFER_MS: u64 = 100;
/// Default minimum buffer clamp (ms).
pub const DEFAULT_MIN_BUFFER_MS: u64 = 50;
/// Default maximum buffer clamp (ms).
pub const DEFAULT_MAX_BUFFER_MS: u64 = 300;

/// Cap on the jitter contribution to bufferTime.
pub const MAX_JITTER_BUFFER_CONTRIB_MS: u64 = 100;
/// Loss-ratio multiplier contribution to bufferTime.
pub const LOSS_BUFFER_CONTRIB_MS: f64 = 50.0;

/// Tick granularity for jitter buffer release checks.
pub const TICK_INTERVAL_MS: u64 = 5;

/// Minimum interval between adaptive bufferTime re-evaluations.
pub const ADAPTATION_INTERVAL_SECS: u64 = 5;
/// Multiplier applied to `target_buffer_ms` on underrun.
pub const ADAPT_UP_FACTOR: f64 = 1.2;
/// Multiplier applied to `target_buffer_ms` on low-jitter overrun.
pub const ADAPT_DOWN_FACTOR: f64 = 0.9;
/// Jitter threshold below which an overrun triggers a downward adaptation.
pub const ADAPT_DOWN_JITTER_THRESHOLD_MS: f64 = 10.0;

/// Window (ms) used to derive `max_chunks` from the effective buffer time.
pub const MAX_CHUNKS_WINDOW_MS: u64 = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default idle timeout before a session is reaped.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 300_000;
/// Default interval between idle-session sweeps.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 30_000;
/// Grace period for a draining session to empty its jitter buffer before
/// the negotiator deregisters it unconditionally.
pub const DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Default per-session memory cap.
pub const DEFAULT_PER_SESSION_MEMORY_BYTES: u64 = 50 * 1024 * 1024;
/// Default process-wide memory cap.
pub const DEFAULT_TOTAL_MEMORY_BYTES: u64 = 500 * 1024 * 1024;

/// Default subtitle duration when a record supplies no explicit end time.
pub const DEFAULT_SUBTITLE_DURATION_MS: u64 = 5_000;

/// Number of consecutive sink failures before a session is treated as
/// session-fatal.
pub const SINK_FAILURE_THRESHOLD: u32 = 5;

/// Capacity of the broadcast channel carrying downstream sink events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
