//! UDP datagram receiver: the ingest side of the data plane.
//!
//! One socket, one task, one reused scratch buffer - datagrams are read,
//! classified, and handed off to each session's tick task without ever
//! touching that session's jitter buffer or subtitle scheduler directly.
//! Socket setup follows the same `socket2`-then-`UdpSocket::from_std`
//! shape used elsewhere in the host corpus for non-blocking UDP sockets,
//! minus the multicast/broadcast options this data plane has no use for.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{RelayError, RelayResult};
use crate::jitter::TimedChunk;
use crate::protocol_constants::RECV_BUFFER_BYTES;
use crate::session::{PipelineMessage, SessionRegistry};
use crate::wire::{self, AudioPacket};

/// Binds a non-blocking UDP socket with `SO_REUSEADDR` set, then hands it
/// to tokio. Plain bind-and-listen; this data plane has no multicast or
/// broadcast concept.
pub fn bind_socket(addr: SocketAddr) -> RelayResult<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| RelayError::SocketBind { addr, source })?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("failed to set SO_REUSEADDR on {addr}: {e}");
    }
    socket
        .set_nonblocking(true)
        .map_err(|source| RelayError::SocketBind { addr, source })?;
    socket
        .bind(&addr.into())
        .map_err(|source| RelayError::SocketBind { addr, source })?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|source| RelayError::SocketBind { addr, source })
}

fn now_ms(epoch: Instant) -> u64 {
    Instant::now().saturating_duration_since(epoch).as_millis() as u64
}

/// Runs the receive loop until the socket errors out or the process is
/// torn down. A session that has not been registered yet (no prior
/// `SESSION_START` on the control plane) is counted as unattributed and
/// the datagram is dropped - the data plane never creates sessions on
/// its own.
pub async fn run(socket: UdpSocket, registry: Arc<SessionRegistry>, epoch: Instant) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];

    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("udp receive failed: {e}");
                continue;
            }
        };

        let packet = match wire::parse_packet(&buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("dropping malformed datagram from {source}: {err}");
                continue;
            }
        };

        handle_packet(&registry, packet, source, epoch);
    }
}

fn handle_packet(registry: &Arc<SessionRegistry>, packet: AudioPacket, source: SocketAddr, epoch: Instant) {
    let Some(inner) = registry.lookup(&packet.session_id) else {
        log::debug!(
            "dropping datagram for unregistered session {}",
            packet.session_id
        );
        return;
    };

    if !registry.endpoint_matches(&packet.session_id, &source) {
        let mut guard = inner.lock();
        guard.stats.endpoint_mismatch += 1;
        log::warn!(
            "datagram for session {} arrived from {source}, expected a different endpoint",
            packet.session_id
        );
        return;
    }

    let now = now_ms(epoch);
    let mut guard = inner.lock();

    let outcome = guard.classify_sequence(packet.seq);
    fold_sequence_outcome(&mut guard.stats, outcome);
    if matches!(outcome, crate::session::SequenceOutcome::Duplicate) {
        return;
    }
    guard.stats.received += 1;
    guard.stats.total_payload_bytes += packet.payload.len() as u64;
    guard.touch(now);

    let subtitle = guard.take_subtitle(packet.seq);
    let schedule = guard
        .sync
        .on_packet(&packet, now, guard.stats.received, guard.stats.lost);
    let baseline = guard.sync.baseline().expect("on_packet always establishes one");
    let session_id = guard.session_id.clone();
    let is_last = packet.is_last;
    drop(guard);

    let chunk = TimedChunk {
        session_id: session_id.clone(),
        payload: packet.payload,
        deadline_ms: schedule.deadline_ms,
        duration_ms: schedule.duration_ms,
        seq: packet.seq,
        subtitle,
        received_at_ms: now,
        effective_buffer_ms: 0,
        out_of_order: matches!(outcome, crate::session::SequenceOutcome::Reorder),
    };

    registry.send_to_pipeline(
        &session_id,
        PipelineMessage::Chunk(chunk, baseline.audio_start_local_ms),
    );

    if let Some(_adjustment) = schedule.slew_applied_ms {
        registry.send_to_pipeline(
            &session_id,
            PipelineMessage::Slew {
                new_audio_start_local_ms: baseline.audio_start_local_ms,
            },
        );
    }

    if is_last {
        registry.send_to_pipeline(&session_id, PipelineMessage::EndOfStream);
    }
}

fn fold_sequence_outcome(stats: &mut crate::session::SessionStats, outcome: crate::session::SequenceOutcome) {
    use crate::session::SequenceOutcome;
    match outcome {
        SequenceOutcome::InOrder => {}
        SequenceOutcome::Gap { lost } => stats.lost += lost as u64,
        SequenceOutcome::Duplicate => stats.duplicate += 1,
        SequenceOutcome::Reorder => stats.reordered += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AudioFormat;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn packet(seq: u32) -> AudioPacket {
        AudioPacket {
            session_id: "s1".into(),
            seq,
            tts_ts: 1_000,
            playback_ts: 1_000,
            format: AudioFormat::Pcm,
            sample_rate: 16_000,
            is_last: false,
            payload: bytes::Bytes::from_static(&[0u8; 320]),
        }
    }

    #[test]
    fn unregistered_session_is_dropped_without_panic() {
        let registry = Arc::new(SessionRegistry::new());
        let epoch = Instant::now();
        handle_packet(&registry, packet(0), addr(9000), epoch);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn endpoint_mismatch_is_counted_and_does_not_advance_sequence() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("s1", addr(9000), AudioFormat::Pcm, 16_000, 0);
        let epoch = Instant::now();

        handle_packet(&registry, packet(0), addr(9999), epoch);

        let inner = registry.lookup("s1").unwrap();
        let guard = inner.lock();
        assert_eq!(guard.stats.endpoint_mismatch, 1);
        assert_eq!(guard.stats.received, 0);
    }

    #[test]
    fn in_order_packet_advances_cursor_and_dispatches() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("s1", addr(9000), AudioFormat::Pcm, 16_000, 0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.set_inbound("s1", tx);
        let epoch = Instant::now();

        handle_packet(&registry, packet(0), addr(9000), epoch);

        let inner = registry.lookup("s1").unwrap();
        assert_eq!(inner.lock().stats.received, 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineMessage::Chunk(_, _))
        ));
    }

    #[test]
    fn resent_packet_is_dropped_without_double_counting_or_redispatch() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("s1", addr(9000), AudioFormat::Pcm, 16_000, 0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.set_inbound("s1", tx);
        let epoch = Instant::now();

        handle_packet(&registry, packet(0), addr(9000), epoch);
        assert!(matches!(rx.try_recv(), Ok(PipelineMessage::Chunk(_, _))));

        handle_packet(&registry, packet(0), addr(9000), epoch);

        let inner = registry.lookup("s1").unwrap();
        let guard = inner.lock();
        assert_eq!(guard.stats.received, 1);
        assert_eq!(guard.stats.duplicate, 1);
        drop(guard);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn last_packet_sends_end_of_stream() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("s1", addr(9000), AudioFormat::Pcm, 16_000, 0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.set_inbound("s1", tx);
        let epoch = Instant::now();

        let mut last = packet(0);
        last.is_last = true;
        handle_packet(&registry, last, addr(9000), epoch);

        assert!(matches!(rx.try_recv(), Ok(PipelineMessage::Chunk(_, _))));
        assert!(matches!(rx.try_recv(), Ok(PipelineMessage::EndOfStream)));
    }
}
