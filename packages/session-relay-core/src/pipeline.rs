//! Per-session tick task: the emission side of the pipeline.
//!
//! Owns a session's [`JitterBuffer`] and [`SubtitleScheduler`] exclusively
//! - nothing else ever touches them - and drains both on one metronome,
//! matching the host project's cadence-loop shape: a fixed-interval timer
//! with `MissedTickBehavior::Delay`, selected alongside an inbound queue
//! and a cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::jitter::{JitterBuffer, JitterConfig, MemoryBudget};
use crate::protocol_constants::{SINK_FAILURE_THRESHOLD, TICK_INTERVAL_MS};
use crate::session::{PipelineMessage, SessionRegistry, SessionState};
use crate::sink::{Sink, SinkEvent};
use crate::subtitle::SubtitleScheduler;
use crate::sync::NetworkCondition;

fn now_ms(epoch: Instant) -> u64 {
    Instant::now().saturating_duration_since(epoch).as_millis() as u64
}

/// Runs one session's tick loop until cancelled or the inbound channel
/// closes. Spawned once per session by the negotiator.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    session_id: String,
    sample_rate: u32,
    jitter_config: JitterConfig,
    memory: MemoryBudget,
    mut inbound: mpsc::UnboundedReceiver<PipelineMessage>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
    epoch: Instant,
) {
    let mut jitter = JitterBuffer::new(jitter_config, now_ms(epoch), memory);
    let mut subtitles = SubtitleScheduler::new();
    let mut draining = false;
    let mut consecutive_sink_failures: u32 = 0;

    // The network condition estimate is ingest-side state (owned by the
    // receiver's SyncEngine); this task only ever takes a short-lived
    // read through the registry's per-session lock, never writes it.
    let condition_snapshot = |registry: &SessionRegistry| -> NetworkCondition {
        registry
            .lookup(&session_id)
            .map(|inner| inner.lock().sync.condition())
            .unwrap_or_default()
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => {
                match msg {
                    Some(PipelineMessage::Chunk(chunk, audio_start_local_ms)) => {
                        let now = now_ms(epoch);
                        let seq = chunk.seq;
                        let subtitle = chunk.subtitle.clone();
                        let condition = condition_snapshot(&registry);
                        if jitter.insert(chunk, &condition, now) == crate::jitter::InsertOutcome::DroppedMemoryPressure {
                            log::warn!("session {session_id} dropped a chunk under memory pressure");
                        }
                        if let Some(subtitle) = subtitle {
                            for event in subtitles.schedule(seq, &session_id, subtitle, audio_start_local_ms, now) {
                                deliver_subtitle(&sink, &session_id, event);
                            }
                        }
                    }
                    Some(PipelineMessage::Slew { new_audio_start_local_ms }) => {
                        let now = now_ms(epoch);
                        for event in subtitles.rebuild(new_audio_start_local_ms, now) {
                            deliver_subtitle(&sink, &session_id, event);
                        }
                    }
                    Some(PipelineMessage::EndOfStream) => {
                        draining = true;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let now = now_ms(epoch);
                let mut sink_busy = false;
                for chunk in jitter.tick(now, draining) {
                    let delivered = deliver_play(&sink, &session_id, sample_rate, &chunk);
                    sink_busy |= !delivered;
                    record_sink_outcome(&registry, &session_id, delivered, &mut consecutive_sink_failures, &mut draining);
                }
                for event in subtitles.tick(now) {
                    let delivered = deliver_subtitle(&sink, &session_id, event);
                    sink_busy |= !delivered;
                    record_sink_outcome(&registry, &session_id, delivered, &mut consecutive_sink_failures, &mut draining);
                }
                let condition = condition_snapshot(&registry);
                jitter.maybe_adapt(now, &condition);

                if draining && jitter.is_empty() {
                    sink.deliver(SinkEvent::OnDrain { session_id: session_id.clone() });
                    break;
                }

                if sink_busy {
                    // Sink signalled backpressure; give it room before the next emission.
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }

    let jitter_stats = jitter.end();
    if let Some(inner) = registry.lookup(&session_id) {
        let mut guard = inner.lock();
        guard.stats.underruns += jitter_stats.underruns;
        guard.stats.overruns += jitter_stats.overruns;
        guard.stats.dropped_late += jitter_stats.dropped_late;
        guard.stats.dropped_overrun += jitter_stats.dropped_overrun;
        guard.stats.memory_pressure_drops += jitter_stats.dropped_memory_pressure;
    }
    registry.deregister(&session_id);
}

fn deliver_play(sink: &Arc<dyn Sink>, session_id: &str, sample_rate: u32, chunk: &crate::jitter::TimedChunk) -> bool {
    let mut event = SinkEvent::play(session_id, chunk);
    if let SinkEvent::OnPlay { sample_rate: rate, .. } = &mut event {
        *rate = sample_rate;
    }
    sink.deliver(event)
}

fn deliver_subtitle(sink: &Arc<dyn Sink>, session_id: &str, event: crate::subtitle::SubtitleEvent) -> bool {
    sink.deliver(SinkEvent::from_subtitle(session_id, event.kind, event.text, event.late))
}

/// Folds one delivery outcome into the session's consecutive-failure
/// counter. A `false` ("busy") outcome accumulates; any `true` resets it.
/// Crossing `SINK_FAILURE_THRESHOLD` moves the session to `Draining` so the
/// tick loop winds down the same way an end-of-stream would, instead of
/// retrying a sink that keeps refusing.
fn record_sink_outcome(
    registry: &SessionRegistry,
    session_id: &str,
    delivered: bool,
    consecutive_failures: &mut u32,
    draining: &mut bool,
) {
    let Some(inner) = registry.lookup(session_id) else {
        return;
    };
    let mut guard = inner.lock();

    if delivered {
        *consecutive_failures = 0;
        guard.stats.sink_failures = 0;
        return;
    }

    *consecutive_failures += 1;
    guard.stats.sink_failures = *consecutive_failures;

    if *consecutive_failures >= SINK_FAILURE_THRESHOLD && guard.state != SessionState::Draining {
        log::warn!("session {session_id} sink failed {consecutive_failures} times in a row, moving to draining");
        guard.state = SessionState::Draining;
        *draining = true;
    }
}
