//! Session registry: identity, endpoint binding, sequence accounting, and
//! lifecycle. Per-session mutable state is split by who touches it -
//! packet accounting belongs to the receiver, the sync/jitter/subtitle
//! sub-states are the tick task's - and coordinated by one mutex per
//! session rather than one lock over the whole map, mirroring an indexed
//! concurrent-map pattern seen in the host corpus.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::jitter::TimedChunk;
use crate::subtitle::SubtitleData;
use crate::sync::{NetworkCondition, SyncEngine};
use crate::wire::AudioFormat;

/// What the receiver hands to a session's tick task across the inbound
/// queue that separates ingest-side from emission-side state.
pub enum PipelineMessage {
    /// A ready-to-schedule chunk plus the baseline's current
    /// `audio_start_local_ms`, needed if the chunk carries a subtitle.
    Chunk(TimedChunk, u64),
    /// The sync engine slewed this session's baseline; pending subtitle
    /// edges must be rebuilt against it.
    Slew { new_audio_start_local_ms: u64 },
    /// The last-flagged packet arrived; drain and close once empty.
    EndOfStream,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Draining,
    Terminated,
}

/// Outcome of handing one datagram to its session's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// `seq == expected`: in-order, advance the cursor by one.
    InOrder,
    /// `seq > expected`: `seq - expected` packets were lost; cursor jumps to `seq + 1`.
    Gap { lost: u32 },
    /// `seq == expected - 1`: a resend of the packet just before the cursor.
    Duplicate,
    /// `seq < expected - 1`: an old packet arriving late, out of sequence.
    Reorder,
}

/// Cumulative counters for one session, finalized on deregistration.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub received: u64,
    pub lost: u64,
    pub duplicate: u64,
    pub reordered: u64,
    pub dropped_late: u64,
    pub dropped_overrun: u64,
    pub unattributed: u64,
    pub endpoint_mismatch: u64,
    pub malformed: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub memory_pressure_drops: u64,
    pub sink_failures: u32,
    pub total_payload_bytes: u64,
    pub start_wall_ms: u64,
    pub end_wall_ms: Option<u64>,
}

impl SessionStats {
    pub fn mean_jitter_ms(&self, condition: &NetworkCondition) -> f64 {
        condition.jitter_ms
    }

    pub fn mean_latency_ms(&self, condition: &NetworkCondition) -> f64 {
        condition.avg_latency_ms
    }

    pub fn total_audio_duration_ms(&self, bytes_per_ms: f64) -> f64 {
        if bytes_per_ms <= 0.0 {
            0.0
        } else {
            self.total_payload_bytes as f64 / bytes_per_ms
        }
    }
}

/// Single-writer-per-phase mutable state for one session. Every field
/// here is ingest-side: owned and written only by the receiver task.
/// The jitter buffer and subtitle scheduler are emission-side and live
/// exclusively inside that session's tick task, reached only through
/// its inbound queue - never through this struct - so the two sides
/// never contend on the same lock.
pub struct SessionInner {
    pub session_id: String,
    pub endpoint: SocketAddr,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub state: SessionState,
    pub expected_seq: u32,
    pub stats: SessionStats,
    pub sync: SyncEngine,
    pub last_activity_ms: u64,
    /// Subtitle records staged ahead of the audio packet they ride with,
    /// keyed by sequence number. The wire format carries no subtitle
    /// field, so these arrive out-of-band (speech-generation metadata on
    /// the control plane) and are matched up when that sequence's
    /// datagram is processed.
    pending_subtitles: HashMap<u32, SubtitleData>,
}

impl SessionInner {
    fn new(
        session_id: String,
        endpoint: SocketAddr,
        format: AudioFormat,
        sample_rate: u32,
        now_local_ms: u64,
    ) -> Self {
        Self {
            session_id,
            endpoint,
            format,
            sample_rate,
            state: SessionState::Pending,
            expected_seq: 0,
            stats: SessionStats {
                start_wall_ms: wall_clock_ms(),
                ..Default::default()
            },
            sync: SyncEngine::new(now_local_ms),
            last_activity_ms: now_local_ms,
            pending_subtitles: HashMap::new(),
        }
    }

    pub fn touch(&mut self, now_local_ms: u64) {
        self.last_activity_ms = now_local_ms;
    }

    pub fn stage_subtitle(&mut self, seq: u32, data: SubtitleData) {
        self.pending_subtitles.insert(seq, data);
    }

    pub fn take_subtitle(&mut self, seq: u32) -> Option<SubtitleData> {
        self.pending_subtitles.remove(&seq)
    }

    /// Classifies `seq` against the session's expected cursor and advances
    /// it. Does not touch `stats` - callers fold the outcome in so
    /// accounting and classification stay decoupled.
    ///
    /// Distance is computed via wrapping subtraction so a cursor near
    /// `u32::MAX` treats a wrapped-around `seq` as forward progress rather
    /// than falling through to `Reorder`.
    pub fn classify_sequence(&mut self, seq: u32) -> SequenceOutcome {
        let expected = self.expected_seq;
        let delta = seq.wrapping_sub(expected) as i32;

        if delta == 0 {
            self.expected_seq = self.expected_seq.wrapping_add(1);
            SequenceOutcome::InOrder
        } else if delta > 0 {
            let lost = delta as u32;
            self.expected_seq = seq.wrapping_add(1);
            SequenceOutcome::Gap { lost }
        } else if delta == -1 {
            SequenceOutcome::Duplicate
        } else {
            SequenceOutcome::Reorder
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Concurrent session registry with an endpoint index for O(1)
/// spoof-check lookups on the receiver's hot path.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Mutex<SessionInner>>>,
    by_endpoint: DashMap<SocketAddr, String>,
    inbound: DashMap<String, mpsc::UnboundedSender<PipelineMessage>>,
    /// Final stats for a session past deregistration, held until whoever
    /// is waiting on teardown (the negotiator) claims them - the tick
    /// task that calls `deregister` on its own exit has no one to hand
    /// its return value to.
    last_stats: DashMap<String, SessionStats>,
    /// Running total of payload bytes buffered across every session's
    /// jitter buffer, shared so each session's `JitterBuffer` can enforce
    /// the process-wide memory cap without reaching back through the
    /// registry on every insert.
    buffered_bytes: Arc<std::sync::atomic::AtomicU64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_endpoint: DashMap::new(),
            inbound: DashMap::new(),
            last_stats: DashMap::new(),
            buffered_bytes: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Handle to the registry-wide buffered-bytes tally, shared with each
    /// session's `JitterBuffer` so it can enforce the total memory cap.
    pub fn buffered_bytes_counter(&self) -> Arc<std::sync::atomic::AtomicU64> {
        self.buffered_bytes.clone()
    }

    /// Binds the channel a session's tick task reads from. Called once
    /// when the negotiator spawns that task.
    pub fn set_inbound(&self, session_id: &str, tx: mpsc::UnboundedSender<PipelineMessage>) {
        self.inbound.insert(session_id.to_string(), tx);
    }

    /// Forwards a message to the session's tick task. Returns `false` if
    /// there is no registered channel or it has been closed (the tick
    /// task already exited).
    pub fn send_to_pipeline(&self, session_id: &str, msg: PipelineMessage) -> bool {
        match self.inbound.get(session_id) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Registers a session, or re-registers it idempotently if the id
    /// already exists (a repeat `SESSION_START`); the endpoint always
    /// takes the newest value since it is control-plane-driven.
    pub fn register(
        &self,
        session_id: &str,
        endpoint: SocketAddr,
        format: AudioFormat,
        sample_rate: u32,
        now_local_ms: u64,
    ) -> Arc<Mutex<SessionInner>> {
        if let Some(existing) = self.sessions.get(session_id) {
            let mut inner = existing.lock();
            if inner.endpoint != endpoint {
                self.by_endpoint.remove(&inner.endpoint);
                self.by_endpoint.insert(endpoint, session_id.to_string());
                inner.endpoint = endpoint;
            }
            inner.format = format;
            inner.sample_rate = sample_rate;
            drop(inner);
            return existing.clone();
        }

        let inner = Arc::new(Mutex::new(SessionInner::new(
            session_id.to_string(),
            endpoint,
            format,
            sample_rate,
            now_local_ms,
        )));
        self.sessions.insert(session_id.to_string(), inner.clone());
        self.by_endpoint.insert(endpoint, session_id.to_string());
        inner
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Mutex<SessionInner>>> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    pub fn lookup_by_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<Mutex<SessionInner>>> {
        let session_id = self.by_endpoint.get(endpoint)?.clone();
        self.lookup(&session_id)
    }

    /// Returns whether `source` matches the registered endpoint for
    /// `session_id` - the receiver's spoof check.
    pub fn endpoint_matches(&self, session_id: &str, source: &SocketAddr) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| e.lock().endpoint == *source)
            .unwrap_or(false)
    }

    pub fn deregister(&self, session_id: &str) -> Option<SessionStats> {
        let (_, inner) = self.sessions.remove(session_id)?;
        let mut guard = inner.lock();
        guard.state = SessionState::Terminated;
        guard.stats.end_wall_ms = Some(wall_clock_ms());
        self.by_endpoint.remove(&guard.endpoint);
        self.inbound.remove(session_id);
        let stats = guard.stats.clone();
        drop(guard);
        self.last_stats.insert(session_id.to_string(), stats.clone());
        Some(stats)
    }

    /// Claims and removes the final stats left behind by a `deregister`
    /// call whose caller had no one to hand the return value to (a tick
    /// task tearing itself down). A no-op if nothing was ever stashed or
    /// it was already claimed.
    pub fn take_final_stats(&self, session_id: &str) -> Option<SessionStats> {
        self.last_stats.remove(session_id).map(|(_, stats)| stats)
    }

    /// Sweeps sessions idle past `timeout_ms` and deregisters them,
    /// returning their ids. Called periodically, not per-packet.
    pub fn expire_idle(&self, now_local_ms: u64, timeout_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                let inner = e.value().lock();
                inner.state != SessionState::Terminated
                    && now_local_ms.saturating_sub(inner.last_activity_ms) > timeout_ms
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.deregister(id);
        }
        expired
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
