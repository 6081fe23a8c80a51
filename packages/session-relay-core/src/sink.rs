//! Downstream event interface: what the jitter buffer and subtitle
//! scheduler hand to whatever plays audio or renders text.
//!
//! Mirrors the host project's `EventEmitter` seam - services depend on
//! a trait, not a concrete transport, so core logic runs against a
//! counting test double without a live sink.

use crate::jitter::TimedChunk;
use crate::subtitle::SubtitleEventKind;

/// One emission from the data-plane pipeline for a sink to act on.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// A chunk reached its deadline and should be played now.
    OnPlay {
        session_id: String,
        payload: bytes::Bytes,
        sample_rate: u32,
        deadline_local_ms: u64,
        sequence: u32,
        out_of_order: bool,
    },
    /// The jitter buffer emptied unexpectedly while the session was active.
    OnUnderrun { session_id: String },
    /// The jitter buffer finished draining at session teardown.
    OnDrain { session_id: String },
    /// A subtitle edge fired.
    ShowSubtitle {
        session_id: String,
        text: String,
        late: bool,
    },
    HideSubtitle {
        session_id: String,
        text: String,
        late: bool,
    },
}

impl SinkEvent {
    pub fn play(session_id: &str, chunk: &TimedChunk) -> Self {
        Self::OnPlay {
            session_id: session_id.to_string(),
            payload: chunk.payload.clone(),
            sample_rate: 0, // filled in by the caller, which knows the session's format
            deadline_local_ms: chunk.deadline_ms,
            sequence: chunk.seq,
            out_of_order: chunk.out_of_order,
        }
    }

    pub fn from_subtitle(session_id: &str, kind: SubtitleEventKind, text: String, late: bool) -> Self {
        match kind {
            SubtitleEventKind::Show => Self::ShowSubtitle {
                session_id: session_id.to_string(),
                text,
                late,
            },
            SubtitleEventKind::Hide => Self::HideSubtitle {
                session_id: session_id.to_string(),
                text,
                late,
            },
        }
    }
}

/// Trait implemented by whatever actually plays audio or renders text.
/// Implementations must not block the tick loop for long; a `busy`
/// return delays the next tick's emission rather than being retried
/// synchronously.
pub trait Sink: Send + Sync {
    /// Delivers one event. Returns `false` ("busy") if the sink could
    /// not accept it right now.
    fn deliver(&self, event: SinkEvent) -> bool;
}

/// Discards every event. Useful when a deployment only wants statistics.
pub struct NoopSink;

impl Sink for NoopSink {
    fn deliver(&self, _event: SinkEvent) -> bool {
        true
    }
}

/// Logs every event at debug level instead of delivering it anywhere.
pub struct LoggingSink;

impl Sink for LoggingSink {
    fn deliver(&self, event: SinkEvent) -> bool {
        tracing::debug!(?event, "sink_event");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        plays: AtomicUsize,
    }

    impl Sink for CountingSink {
        fn deliver(&self, event: SinkEvent) -> bool {
            if matches!(event, SinkEvent::OnPlay { .. }) {
                self.plays.fetch_add(1, Ordering::SeqCst);
            }
            true
        }
    }

    #[test]
    fn counting_sink_tracks_play_events() {
        let sink = CountingSink {
            plays: AtomicUsize::new(0),
        };
        sink.deliver(SinkEvent::OnPlay {
            session_id: "s1".into(),
            payload: bytes::Bytes::new(),
            sample_rate: 16000,
            deadline_local_ms: 0,
            sequence: 0,
            out_of_order: false,
        });
        sink.deliver(SinkEvent::OnUnderrun {
            session_id: "s1".into(),
        });
        assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_sink_always_accepts() {
        let sink = NoopSink;
        assert!(sink.deliver(SinkEvent::OnDrain {
            session_id: "s1".into(),
        }));
    }
}
