//! Clock-offset baseline and network-condition estimation for one session.
//!
//! Kept as a single module (rather than split across the registry and a
//! separate estimator) so the two halves never drift apart on what "now"
//! on the sender's clock means. The slew step below mirrors the bounded,
//! never-step rate-adjustment shape of a receiver implementation seen in
//! the example pool: track a signed offset, nudge it by a fixed fraction,
//! never jump.

use crate::protocol_constants::{
    DEFAULT_CHUNK_DURATION_MS, DEFAULT_NETWORK_LATENCY_MS, JITTER_SMOOTHING_ALPHA,
    MAX_AUTO_CORRECT_DRIFT_MS, MAX_JITTER_COMP_MS, MIN_NETWORK_LATENCY_MS, MIN_SCHEDULE_AHEAD_MS,
    PREBUFFER_MS, SLEW_FRACTION, SLEW_TRIGGER_DRIFT_MS,
};
use crate::wire::AudioPacket;

/// Rolling estimate of this session's network behavior, updated on every
/// accepted packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkCondition {
    pub avg_latency_ms: f64,
    /// Smoothed mean-absolute inter-arrival error, not RFC 3550 jitter.
    pub jitter_ms: f64,
    pub packet_loss_ratio: f64,
    pub estimated_bandwidth_bps: f64,
}

/// The clock-offset fix established from a session's first packet.
#[derive(Debug, Clone, Copy)]
pub struct SyncBaseline {
    pub audio_start_local_ms: u64,
    pub clock_offset_ms: i64,
    first_tts_ts: u64,
}

/// Scheduling outcome for one packet: when it must reach the sink, and
/// how long its audio runs for.
#[derive(Debug, Clone, Copy)]
pub struct PacketSchedule {
    pub deadline_ms: u64,
    pub duration_ms: u64,
    /// Set when this packet's processing triggered a baseline slew; callers
    /// (the subtitle scheduler) must rebuild pending edges when present.
    pub slew_applied_ms: Option<i64>,
}

/// Per-session clock mapping and condition estimator.
pub struct SyncEngine {
    baseline: Option<SyncBaseline>,
    condition: NetworkCondition,
    session_start_local_ms: u64,
    latency_sum_ms: f64,
    latency_count: u64,
    last_received_at_ms: Option<u64>,
    last_playback_ts: Option<u64>,
    total_payload_bytes: u64,
}

impl SyncEngine {
    pub fn new(now_local_ms: u64) -> Self {
        Self {
            baseline: None,
            condition: NetworkCondition::default(),
            session_start_local_ms: now_local_ms,
            latency_sum_ms: 0.0,
            latency_count: 0,
            last_received_at_ms: None,
            last_playback_ts: None,
            total_payload_bytes: 0,
        }
    }

    pub fn baseline(&self) -> Option<SyncBaseline> {
        self.baseline
    }

    pub fn condition(&self) -> NetworkCondition {
        self.condition
    }

    /// Processes one accepted packet: establishes the baseline if this is
    /// the first packet, updates the rolling condition estimate, and
    /// returns the deadline/duration this chunk should be scheduled with.
    ///
    /// `received_total`/`lost_total` come from the session's packet
    /// accounting (receiver-side), since loss tracking depends on
    /// sequence-gap detection that happens before dispatch here.
    pub fn on_packet(
        &mut self,
        pkt: &AudioPacket,
        now_local_ms: u64,
        received_total: u64,
        lost_total: u64,
    ) -> PacketSchedule {
        let just_established = self.baseline.is_none();
        let baseline = *self
            .baseline
            .get_or_insert_with(|| Self::establish_baseline(pkt, now_local_ms));

        self.update_condition(pkt, now_local_ms, received_total, lost_total);

        let relative = pkt.playback_ts as i64 - pkt.tts_ts as i64;
        let target = baseline.audio_start_local_ms as i64 + relative;
        let jitter_comp = (2.0 * self.condition.jitter_ms).min(MAX_JITTER_COMP_MS as f64) as i64;
        let floor = now_local_ms as i64 + MIN_SCHEDULE_AHEAD_MS as i64;
        let deadline_ms = (target + jitter_comp).max(floor).max(0) as u64;

        let duration_ms = self.estimate_duration(pkt);

        // The baseline's own fixed constants (prebuffer vs. default network
        // latency) produce an apparent offset on the very first sample;
        // only consider slewing once at least one more packet has landed.
        let slew_applied_ms = if just_established {
            None
        } else {
            self.maybe_slew(baseline)
        };

        self.last_received_at_ms = Some(now_local_ms);
        self.last_playback_ts = Some(pkt.playback_ts);
        self.total_payload_bytes += pkt.payload.len() as u64;

        PacketSchedule {
            deadline_ms,
            duration_ms,
            slew_applied_ms,
        }
    }

    fn establish_baseline(pkt: &AudioPacket, now_local_ms: u64) -> SyncBaseline {
        let processing_delay = now_local_ms as i64 - pkt.tts_ts as i64;
        let network_latency = (DEFAULT_NETWORK_LATENCY_MS as i64).max(MIN_NETWORK_LATENCY_MS as i64);
        let audio_start_local_ms = now_local_ms + PREBUFFER_MS;
        let clock_offset_ms = processing_delay + network_latency;
        SyncBaseline {
            audio_start_local_ms,
            clock_offset_ms,
            first_tts_ts: pkt.tts_ts,
        }
    }

    fn update_condition(
        &mut self,
        pkt: &AudioPacket,
        now_local_ms: u64,
        received_total: u64,
        lost_total: u64,
    ) {
        let sample_latency = (now_local_ms as i64 - pkt.tts_ts as i64) as f64;
        self.latency_sum_ms += sample_latency;
        self.latency_count += 1;
        self.condition.avg_latency_ms = self.latency_sum_ms / self.latency_count as f64;

        if let (Some(last_recv), Some(last_playback)) =
            (self.last_received_at_ms, self.last_playback_ts)
        {
            let observed_interarrival = (now_local_ms - last_recv) as f64;
            let expected_interarrival = (pkt.playback_ts as i64 - last_playback as i64) as f64;
            let error = (observed_interarrival - expected_interarrival).abs();
            self.condition.jitter_ms =
                JITTER_SMOOTHING_ALPHA * error + (1.0 - JITTER_SMOOTHING_ALPHA) * self.condition.jitter_ms;
        }

        let denom = lost_total + received_total;
        self.condition.packet_loss_ratio = if denom == 0 {
            0.0
        } else {
            lost_total as f64 / denom as f64
        };

        let elapsed_s = (now_local_ms.saturating_sub(self.session_start_local_ms)) as f64 / 1000.0;
        self.condition.estimated_bandwidth_bps = if elapsed_s > 0.0 {
            (self.total_payload_bytes as f64 * 8.0) / elapsed_s
        } else {
            0.0
        };
    }

    fn estimate_duration(&self, pkt: &AudioPacket) -> u64 {
        if pkt.format.is_pcm() {
            let bytes_per_sample = 2u64; // 16-bit PCM; wire format carries no float flag
            let channels = 1u64; // mono assumed; wire format carries no channel count
            let denom = bytes_per_sample * channels * pkt.sample_rate.max(1) as u64;
            (pkt.payload.len() as u64 * 1000) / denom.max(1)
        } else {
            match self.last_playback_ts {
                Some(last_playback) if pkt.playback_ts > last_playback => {
                    pkt.playback_ts - last_playback
                }
                _ => DEFAULT_CHUNK_DURATION_MS,
            }
        }
    }

    /// Applies a bounded slew to the baseline's clock offset if observed
    /// drift exceeds the trigger threshold, and reports it so the caller
    /// can rebuild dependent schedules (subtitles). Drift beyond the
    /// auto-correct ceiling is left for the control plane to resolve.
    fn maybe_slew(&mut self, baseline: SyncBaseline) -> Option<i64> {
        let expected_offset = baseline.clock_offset_ms - PREBUFFER_MS as i64;
        let drift = self.condition.avg_latency_ms as i64 - expected_offset;

        if drift.abs() > MAX_AUTO_CORRECT_DRIFT_MS {
            return None;
        }
        if drift.abs() <= SLEW_TRIGGER_DRIFT_MS {
            return None;
        }

        let adjustment = (drift as f64 * SLEW_FRACTION) as i64;
        if adjustment == 0 {
            return None;
        }

        let mut updated = baseline;
        updated.clock_offset_ms += adjustment;
        updated.audio_start_local_ms = (updated.audio_start_local_ms as i64 + adjustment).max(0) as u64;
        self.baseline = Some(updated);
        Some(adjustment)
    }
}
