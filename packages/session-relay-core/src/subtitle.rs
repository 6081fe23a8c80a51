//! Subtitle show/hide scheduling anchored to a session's sync timeline.
//!
//! One min-heap per session holds pending edges, drained by the same
//! tick loop that releases jitter-buffer chunks - no per-subtitle timer
//! task. On a baseline slew the heap is rebuilt from the still-pending
//! records against the new baseline; subtitle volume is low enough next
//! to audio chunk volume that this is cheap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::protocol_constants::DEFAULT_SUBTITLE_DURATION_MS;

/// A subtitle record as attached to a chunk, offsets relative to the
/// session's audio-start reference.
#[derive(Debug, Clone)]
pub struct SubtitleData {
    pub text: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub tts_offset_ms: Option<i64>,
    pub confidence: Option<f32>,
}

impl SubtitleData {
    /// `end_time_ms` defaulted when a record supplies none.
    pub fn with_default_duration(text: String, start_time_ms: u64) -> Self {
        Self {
            text,
            start_time_ms,
            end_time_ms: start_time_ms + DEFAULT_SUBTITLE_DURATION_MS,
            tts_offset_ms: None,
            confidence: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleEventKind {
    Show,
    Hide,
}

#[derive(Debug, Clone)]
pub struct SubtitleEvent {
    pub session_id: String,
    pub text: String,
    pub kind: SubtitleEventKind,
    pub late: bool,
}

struct PendingSubtitle {
    session_id: String,
    subtitle: SubtitleData,
    show_fired: bool,
    hide_fired: bool,
}

const EDGE_SHOW: u8 = 0;
const EDGE_HIDE: u8 = 1;

/// Per-session subtitle edge scheduler.
pub struct SubtitleScheduler {
    heap: BinaryHeap<Reverse<(u64, u32, u8)>>,
    pending: HashMap<u32, PendingSubtitle>,
}

impl Default for SubtitleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SubtitleScheduler {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Arms show/hide edges for one chunk's subtitle. Edges already due
    /// at `now_local_ms` fire immediately (flagged late) instead of being
    /// queued.
    pub fn schedule(
        &mut self,
        seq: u32,
        session_id: &str,
        subtitle: SubtitleData,
        audio_start_local_ms: u64,
        now_local_ms: u64,
    ) -> Vec<SubtitleEvent> {
        let show_ms = audio_start_local_ms + subtitle.start_time_ms;
        let hide_ms = audio_start_local_ms + subtitle.end_time_ms;

        let mut immediate = Vec::new();
        let mut show_fired = false;
        let mut hide_fired = false;

        if show_ms <= now_local_ms {
            immediate.push(SubtitleEvent {
                session_id: session_id.to_string(),
                text: subtitle.text.clone(),
                kind: SubtitleEventKind::Show,
                late: true,
            });
            show_fired = true;
        } else {
            self.heap.push(Reverse((show_ms, seq, EDGE_SHOW)));
        }

        if hide_ms <= now_local_ms {
            immediate.push(SubtitleEvent {
                session_id: session_id.to_string(),
                text: subtitle.text.clone(),
                kind: SubtitleEventKind::Hide,
                late: true,
            });
            hide_fired = true;
        } else {
            self.heap.push(Reverse((hide_ms, seq, EDGE_HIDE)));
        }

        if !(show_fired && hide_fired) {
            self.pending.insert(
                seq,
                PendingSubtitle {
                    session_id: session_id.to_string(),
                    subtitle,
                    show_fired,
                    hide_fired,
                },
            );
        }

        immediate
    }

    /// Drains every edge due at or before `now_local_ms`.
    pub fn tick(&mut self, now_local_ms: u64) -> Vec<SubtitleEvent> {
        let mut events = Vec::new();
        while let Some(&Reverse((deadline, seq, edge))) = self.heap.peek() {
            if deadline > now_local_ms {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.fire(seq, edge, false) {
                events.push(event);
            }
        }
        events
    }

    fn fire(&mut self, seq: u32, edge: u8, late: bool) -> Option<SubtitleEvent> {
        let pending = self.pending.get_mut(&seq)?;
        let kind = if edge == EDGE_SHOW {
            pending.show_fired = true;
            SubtitleEventKind::Show
        } else {
            pending.hide_fired = true;
            SubtitleEventKind::Hide
        };
        let event = SubtitleEvent {
            session_id: pending.session_id.clone(),
            text: pending.subtitle.text.clone(),
            kind,
            late,
        };
        if pending.show_fired && pending.hide_fired {
            self.pending.remove(&seq);
        }
        Some(event)
    }

    /// Rebuilds all still-pending edges against a new baseline after a
    /// sync-engine slew, discarding any that have already fired.
    pub fn rebuild(&mut self, new_audio_start_local_ms: u64, now_local_ms: u64) -> Vec<SubtitleEvent> {
        self.heap.clear();
        let seqs: Vec<u32> = self.pending.keys().copied().collect();
        let mut immediate = Vec::new();

        for seq in seqs {
            let (session_id, subtitle, show_fired, hide_fired) = {
                let p = self.pending.get(&seq).unwrap();
                (
                    p.session_id.clone(),
                    p.subtitle.clone(),
                    p.show_fired,
                    p.hide_fired,
                )
            };

            let show_ms = new_audio_start_local_ms + subtitle.start_time_ms;
            let hide_ms = new_audio_start_local_ms + subtitle.end_time_ms;

            if !show_fired {
                if show_ms <= now_local_ms {
                    immediate.push(SubtitleEvent {
                        session_id: session_id.clone(),
                        text: subtitle.text.clone(),
                        kind: SubtitleEventKind::Show,
                        late: true,
                    });
                    self.pending.get_mut(&seq).unwrap().show_fired = true;
                } else {
                    self.heap.push(Reverse((show_ms, seq, EDGE_SHOW)));
                }
            }

            if !hide_fired {
                if hide_ms <= now_local_ms {
                    immediate.push(SubtitleEvent {
                        session_id,
                        text: subtitle.text.clone(),
                        kind: SubtitleEventKind::Hide,
                        late: true,
                    });
                    self.pending.get_mut(&seq).unwrap().hide_fired = true;
                } else {
                    self.heap.push(Reverse((hide_ms, seq, EDGE_HIDE)));
                }
            }

            let p = self.pending.get(&seq).unwrap();
            if p.show_fired && p.hide_fired {
                self.pending.remove(&seq);
            }
        }

        immediate
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
