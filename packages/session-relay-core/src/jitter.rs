//! Adaptive per-session jitter buffer.
//!
//! Backed by a `BTreeMap<(deadline_ms, seq), TimedChunk>` rather than a
//! custom heap - deterministic tie-broken ordering with `O(log n)`
//! insert/evict/pop-front for free. The tick loop this buffer is driven
//! by follows a metronome shape: a fixed-granularity interval, read
//! alongside the per-session inbound queue and the cancellation token,
//! with `MissedTickBehavior::Delay` rather than `Burst` - a catch-up
//! burst would dump a pile of chunks at once and defeat the point of
//! pacing releases.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol_constants::{
    ADAPTATION_INTERVAL_SECS, ADAPT_DOWN_FACTOR, ADAPT_DOWN_JITTER_THRESHOLD_MS, ADAPT_UP_FACTOR,
    DEFAULT_MAX_BUFFER_MS, DEFAULT_MIN_BUFFER_MS, DEFAULT_TARGET_BUFFER_MS, LOSS_BUFFER_CONTRIB_MS,
    MAX_CHUNKS_WINDOW_MS, MAX_JITTER_BUFFER_CONTRIB_MS,
};
use crate::subtitle::SubtitleData;
use crate::sync::NetworkCondition;

/// Post-sync internal form of one audio chunk, ready for ordered release.
#[derive(Debug, Clone)]
pub struct TimedChunk {
    pub session_id: String,
    pub payload: Bytes,
    pub deadline_ms: u64,
    pub duration_ms: u64,
    pub seq: u32,
    pub subtitle: Option<SubtitleData>,
    pub received_at_ms: u64,
    pub effective_buffer_ms: u64,
    pub out_of_order: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct JitterConfig {
    pub target_buffer_ms: u64,
    pub min_buffer_ms: u64,
    pub max_buffer_ms: u64,
    pub adaptive: bool,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_buffer_ms: DEFAULT_TARGET_BUFFER_MS,
            min_buffer_ms: DEFAULT_MIN_BUFFER_MS,
            max_buffer_ms: DEFAULT_MAX_BUFFER_MS,
            adaptive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DroppedLate,
    /// Rejected because accepting it would exceed the per-session or the
    /// process-wide memory cap.
    DroppedMemoryPressure,
}

#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    pub underruns: u64,
    pub overruns: u64,
    pub dropped_late: u64,
    pub dropped_overrun: u64,
    pub dropped_memory_pressure: u64,
}

/// This session's byte caps plus a handle to the registry-wide tally, so
/// `JitterBuffer::insert` can enforce both the per-session and the
/// process-wide memory cap without reaching back into the registry.
#[derive(Clone)]
pub struct MemoryBudget {
    pub per_session_bytes: u64,
    pub total_bytes: u64,
    pub total_buffered: Arc<AtomicU64>,
}

/// Ordered, deadline-release buffer for one session.
pub struct JitterBuffer {
    config: JitterConfig,
    chunks: BTreeMap<(u64, u32), TimedChunk>,
    stats: JitterStats,
    recent_underruns: u64,
    recent_overruns: u64,
    last_adaptation_ms: u64,
    last_emitted_deadline_ms: u64,
    memory: MemoryBudget,
    payload_bytes: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig, now_ms: u64, memory: MemoryBudget) -> Self {
        Self {
            config,
            chunks: BTreeMap::new(),
            stats: JitterStats::default(),
            recent_underruns: 0,
            recent_overruns: 0,
            last_adaptation_ms: now_ms,
            last_emitted_deadline_ms: 0,
            memory,
            payload_bytes: 0,
        }
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }

    pub fn target_buffer_ms(&self) -> u64 {
        self.config.target_buffer_ms
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    fn release_bytes(&mut self, n: u64) {
        self.payload_bytes = self.payload_bytes.saturating_sub(n);
        let _ = self
            .memory
            .total_buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(n)));
    }

    fn effective_buffer_time(&self, condition: &NetworkCondition) -> u64 {
        let jitter_contrib = (2.0 * condition.jitter_ms).min(MAX_JITTER_BUFFER_CONTRIB_MS as f64);
        let loss_contrib = LOSS_BUFFER_CONTRIB_MS * condition.packet_loss_ratio;
        let raw = self.config.target_buffer_ms as f64 + jitter_contrib + loss_contrib;
        (raw.round() as u64).clamp(self.config.min_buffer_ms, self.config.max_buffer_ms)
    }

    fn max_chunks(buffer_time_ms: u64) -> usize {
        ((2 * buffer_time_ms) as f64 / MAX_CHUNKS_WINDOW_MS as f64).ceil() as usize
    }

    /// Inserts a chunk, decorating it with this moment's effective buffer
    /// time. Drops (and counts) chunks already late on arrival or that
    /// would push this session past its per-session byte cap or the
    /// registry past its process-wide cap, and evicts the oldest chunk by
    /// deadline if the buffer overflows its chunk-count window.
    pub fn insert(&mut self, mut chunk: TimedChunk, condition: &NetworkCondition, now_ms: u64) -> InsertOutcome {
        if chunk.deadline_ms < now_ms {
            self.stats.dropped_late += 1;
            return InsertOutcome::DroppedLate;
        }

        let payload_len = chunk.payload.len() as u64;
        if self.payload_bytes + payload_len > self.memory.per_session_bytes {
            self.stats.dropped_memory_pressure += 1;
            return InsertOutcome::DroppedMemoryPressure;
        }
        let total_buffered = self.memory.total_buffered.load(Ordering::Relaxed);
        if total_buffered + payload_len > self.memory.total_bytes {
            self.stats.dropped_memory_pressure += 1;
            return InsertOutcome::DroppedMemoryPressure;
        }

        self.payload_bytes += payload_len;
        self.memory.total_buffered.fetch_add(payload_len, Ordering::Relaxed);

        let buffer_time = self.effective_buffer_time(condition);
        chunk.effective_buffer_ms = buffer_time;
        chunk.out_of_order = chunk.deadline_ms < self.last_emitted_deadline_ms;
        self.chunks.insert((chunk.deadline_ms, chunk.seq), chunk);

        let max_chunks = Self::max_chunks(buffer_time);
        while self.chunks.len() > max_chunks {
            if let Some((&key, _)) = self.chunks.iter().next() {
                if let Some(evicted) = self.chunks.remove(&key) {
                    self.release_bytes(evicted.payload.len() as u64);
                }
                self.stats.overruns += 1;
                self.stats.dropped_overrun += 1;
                self.recent_overruns += 1;
            } else {
                break;
            }
        }

        InsertOutcome::Inserted
    }

    /// Releases every chunk whose `(deadline + bufferTime)` has elapsed.
    /// `draining` suppresses the underrun counter for a session that is
    /// intentionally emptying out.
    pub fn tick(&mut self, now_ms: u64, draining: bool) -> Vec<TimedChunk> {
        let mut released = Vec::new();

        loop {
            let Some((&key, chunk)) = self.chunks.iter().next() else {
                break;
            };
            if chunk.deadline_ms + chunk.effective_buffer_ms > now_ms {
                break;
            }
            let chunk = self.chunks.remove(&key).unwrap();
            self.release_bytes(chunk.payload.len() as u64);
            self.last_emitted_deadline_ms = self.last_emitted_deadline_ms.max(chunk.deadline_ms);
            released.push(chunk);
        }

        if self.chunks.is_empty() && !released.is_empty() && !draining {
            self.stats.underruns += 1;
            self.recent_underruns += 1;
        }

        released
    }

    /// Evaluated at most every `ADAPTATION_INTERVAL_SECS`: grows the
    /// target buffer on underrun, shrinks it on a low-jitter overrun.
    /// Returns the new target when an adaptation occurred.
    pub fn maybe_adapt(&mut self, now_ms: u64, condition: &NetworkCondition) -> Option<u64> {
        if !self.config.adaptive {
            return None;
        }
        if now_ms.saturating_sub(self.last_adaptation_ms) < ADAPTATION_INTERVAL_SECS * 1000 {
            return None;
        }

        let mut adapted = None;
        if self.recent_underruns > 0 {
            let new_target = ((self.config.target_buffer_ms as f64) * ADAPT_UP_FACTOR) as u64;
            self.config.target_buffer_ms = new_target.min(self.config.max_buffer_ms);
            adapted = Some(self.config.target_buffer_ms);
        } else if self.recent_overruns > 0 && condition.jitter_ms < ADAPT_DOWN_JITTER_THRESHOLD_MS {
            let new_target = ((self.config.target_buffer_ms as f64) * ADAPT_DOWN_FACTOR) as u64;
            self.config.target_buffer_ms = new_target.max(self.config.min_buffer_ms);
            adapted = Some(self.config.target_buffer_ms);
        }

        self.recent_underruns = 0;
        self.recent_overruns = 0;
        self.last_adaptation_ms = now_ms;
        adapted
    }

    /// Final stats at session teardown; any chunks still buffered are
    /// simply dropped (the session is closing, not underrunning).
    pub fn end(&mut self) -> JitterStats {
        let remaining: u64 = self.chunks.values().map(|c| c.payload.len() as u64).sum();
        self.release_bytes(remaining);
        self.chunks.clear();
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u32, deadline_ms: u64) -> TimedChunk {
        TimedChunk {
            session_id: "s1".into(),
            payload: Bytes::from_static(b"x"),
            deadline_ms,
            duration_ms: 20,
            seq,
            subtitle: None,
            received_at_ms: 0,
            effective_buffer_ms: 0,
            out_of_order: false,
        }
    }

    fn quiet_condition() -> NetworkCondition {
        NetworkCondition {
            avg_latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss_ratio: 0.0,
            estimated_bandwidth_bps: 0.0,
        }
    }

    fn unlimited_memory() -> MemoryBudget {
        MemoryBudget {
            per_session_bytes: u64::MAX,
            total_bytes: u64::MAX,
            total_buffered: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn releases_in_deadline_order_once_buffer_time_elapses() {
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, unlimited_memory());
        let cond = quiet_condition();
        buf.insert(chunk(0, 1_000), &cond, 0);
        buf.insert(chunk(1, 1_010), &cond, 0);

        // effective buffer time = 100ms (default target, no jitter/loss)
        assert!(buf.tick(1_050, false).is_empty());
        let released = buf.tick(1_100, false);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].seq, 0);

        let released = buf.tick(1_110, false);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].seq, 1);
    }

    #[test]
    fn drops_late_chunks_on_insert() {
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, unlimited_memory());
        let cond = quiet_condition();
        let outcome = buf.insert(chunk(0, 500), &cond, 1_000);
        assert_eq!(outcome, InsertOutcome::DroppedLate);
        assert_eq!(buf.stats().dropped_late, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn evicts_oldest_on_overrun() {
        let mut config = JitterConfig::default();
        config.target_buffer_ms = 20;
        config.min_buffer_ms = 20;
        config.max_buffer_ms = 20;
        let mut buf = JitterBuffer::new(config, 0, unlimited_memory());
        let cond = quiet_condition();

        // max_chunks at 20ms buffer = ceil(40/20) = 2
        buf.insert(chunk(0, 1_000), &cond, 0);
        buf.insert(chunk(1, 1_001), &cond, 0);
        buf.insert(chunk(2, 1_002), &cond, 0);

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.stats().overruns, 1);
        // the oldest deadline (1000) was evicted, 1001/1002 remain
        assert!(buf.chunks.contains_key(&(1_001, 1)));
        assert!(buf.chunks.contains_key(&(1_002, 2)));
    }

    #[test]
    fn underrun_counted_when_buffer_drains_while_active() {
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, unlimited_memory());
        let cond = quiet_condition();
        buf.insert(chunk(0, 1_000), &cond, 0);
        buf.tick(1_100, false);
        assert_eq!(buf.stats().underruns, 1);
    }

    #[test]
    fn draining_suppresses_underrun_counter() {
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, unlimited_memory());
        let cond = quiet_condition();
        buf.insert(chunk(0, 1_000), &cond, 0);
        buf.tick(1_100, true);
        assert_eq!(buf.stats().underruns, 0);
    }

    #[test]
    fn adapts_up_after_underrun_and_respects_interval() {
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, unlimited_memory());
        let cond = quiet_condition();
        buf.insert(chunk(0, 1_000), &cond, 0);
        buf.tick(1_100, false);

        assert!(buf.maybe_adapt(1_000, &cond).is_none()); // too soon
        let adapted = buf.maybe_adapt(6_000, &cond);
        assert_eq!(adapted, Some(120));
    }

    #[test]
    fn insert_rejects_chunk_that_would_exceed_per_session_cap() {
        let memory = MemoryBudget {
            per_session_bytes: 1,
            total_bytes: u64::MAX,
            total_buffered: Arc::new(AtomicU64::new(0)),
        };
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, memory);
        let cond = quiet_condition();

        let outcome = buf.insert(chunk(0, 1_000), &cond, 0);
        assert_eq!(outcome, InsertOutcome::DroppedMemoryPressure);
        assert_eq!(buf.stats().dropped_memory_pressure, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn insert_rejects_chunk_that_would_exceed_process_wide_cap_shared_across_sessions() {
        let shared = Arc::new(AtomicU64::new(0));
        let other_session_memory = MemoryBudget {
            per_session_bytes: u64::MAX,
            total_bytes: 2,
            total_buffered: shared.clone(),
        };
        let mut other = JitterBuffer::new(JitterConfig::default(), 0, other_session_memory);
        let cond = quiet_condition();
        assert_eq!(other.insert(chunk(0, 1_000), &cond, 0), InsertOutcome::Inserted);

        let this_session_memory = MemoryBudget {
            per_session_bytes: u64::MAX,
            total_bytes: 2,
            total_buffered: shared,
        };
        let mut this = JitterBuffer::new(JitterConfig::default(), 0, this_session_memory);
        let outcome = this.insert(chunk(1, 1_000), &cond, 0);
        assert_eq!(outcome, InsertOutcome::DroppedMemoryPressure);
        assert_eq!(this.stats().dropped_memory_pressure, 1);
    }

    #[test]
    fn released_chunks_free_their_reserved_bytes() {
        let shared = Arc::new(AtomicU64::new(0));
        let memory = MemoryBudget { per_session_bytes: u64::MAX, total_bytes: u64::MAX, total_buffered: shared.clone() };
        let mut buf = JitterBuffer::new(JitterConfig::default(), 0, memory);
        let cond = quiet_condition();
        buf.insert(chunk(0, 1_000), &cond, 0);
        assert_eq!(buf.payload_bytes(), 1);
        assert_eq!(shared.load(Ordering::Relaxed), 1);

        buf.tick(1_100, false);
        assert_eq!(buf.payload_bytes(), 0);
        assert_eq!(shared.load(Ordering::Relaxed), 0);
    }
}
