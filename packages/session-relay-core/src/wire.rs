//! UDP wire format for audio datagrams.
//!
//! `u8 sid_len | sid_len bytes session_id | u32 seq | u64 tts_ts | u64 playback_ts
//! | u8 fmt | u32 sample_rate | u8 is_last | u32 payload_len | payload_len bytes payload`,
//! all big-endian. No base64, no framing beyond the datagram boundary itself -
//! each UDP datagram is exactly one packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol_constants::{
    FORMAT_TAG_MP3, FORMAT_TAG_OPUS, FORMAT_TAG_PCM, MAX_SESSION_ID_LEN, WIRE_HEADER_MIN_BYTES,
};

/// Audio payload format, as declared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    Pcm,
    Mp3,
    Opus,
}

impl AudioFormat {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            FORMAT_TAG_PCM => Some(Self::Pcm),
            FORMAT_TAG_MP3 => Some(Self::Mp3),
            FORMAT_TAG_OPUS => Some(Self::Opus),
            _ => None,
        }
    }

    fn to_tag(self) -> u8 {
        match self {
            Self::Pcm => FORMAT_TAG_PCM,
            Self::Mp3 => FORMAT_TAG_MP3,
            Self::Opus => FORMAT_TAG_OPUS,
        }
    }

    /// Whether this format's duration is derived from the byte count
    /// (pcm) rather than inter-packet timestamp deltas (compressed).
    pub fn is_pcm(self) -> bool {
        matches!(self, Self::Pcm)
    }
}

/// A parsed datagram, prior to session/sequence accounting.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub session_id: String,
    pub seq: u32,
    pub tts_ts: u64,
    pub playback_ts: u64,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

/// Why a datagram was rejected during parsing. Transient; callers count
/// these, they never propagate as a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireParseError {
    TooShort,
    SessionIdTooLong,
    InvalidSessionId,
    PayloadLengthMismatch,
    UnknownFormat,
}

impl std::fmt::Display for WireParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::TooShort => "datagram shorter than minimum header size",
            Self::SessionIdTooLong => "session id exceeds maximum length",
            Self::InvalidSessionId => "session id contains invalid characters",
            Self::PayloadLengthMismatch => "declared payload_len does not match remaining bytes",
            Self::UnknownFormat => "unrecognized format tag",
        };
        f.write_str(msg)
    }
}

/// Returns true if every byte is `[A-Za-z0-9_-]`, matching the session id
/// grammar.
pub fn is_valid_session_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_SESSION_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Parses one datagram. A malformed datagram is never fatal - the
/// receiver counts it and moves on.
pub fn parse_packet(datagram: &[u8]) -> Result<AudioPacket, WireParseError> {
    let mut buf = datagram;

    if buf.is_empty() {
        return Err(WireParseError::TooShort);
    }
    let sid_len = buf.get_u8() as usize;

    if sid_len > MAX_SESSION_ID_LEN {
        return Err(WireParseError::SessionIdTooLong);
    }
    // WIRE_HEADER_MIN_BYTES already accounts for the sid_len byte itself.
    if buf.remaining() < sid_len + (WIRE_HEADER_MIN_BYTES - 1) {
        return Err(WireParseError::TooShort);
    }

    let sid_bytes = buf.copy_to_bytes(sid_len);
    let session_id = std::str::from_utf8(&sid_bytes)
        .ok()
        .filter(|s| is_valid_session_id(s))
        .ok_or(WireParseError::InvalidSessionId)?
        .to_string();

    let seq = buf.get_u32();
    let tts_ts = buf.get_u64();
    let playback_ts = buf.get_u64();
    let fmt_tag = buf.get_u8();
    let sample_rate = buf.get_u32();
    let is_last = buf.get_u8() != 0;
    let payload_len = buf.get_u32() as usize;

    if buf.remaining() != payload_len {
        return Err(WireParseError::PayloadLengthMismatch);
    }
    let format = AudioFormat::from_tag(fmt_tag).ok_or(WireParseError::UnknownFormat)?;

    Ok(AudioPacket {
        session_id,
        seq,
        tts_ts,
        playback_ts,
        format,
        sample_rate,
        is_last,
        payload: buf.copy_to_bytes(buf.remaining()),
    })
}

/// Encodes a packet back to wire format. Used by tests and by any
/// embedder-side harness that needs to synthesize datagrams.
pub fn encode_packet(pkt: &AudioPacket) -> Bytes {
    let sid_bytes = pkt.session_id.as_bytes();
    let mut out =
        BytesMut::with_capacity(WIRE_HEADER_MIN_BYTES + sid_bytes.len() + pkt.payload.len());
    out.put_u8(sid_bytes.len() as u8);
    out.put_slice(sid_bytes);
    out.put_u32(pkt.seq);
    out.put_u64(pkt.tts_ts);
    out.put_u64(pkt.playback_ts);
    out.put_u8(pkt.format.to_tag());
    out.put_u32(pkt.sample_rate);
    out.put_u8(pkt.is_last as u8);
    out.put_u32(pkt.payload.len() as u32);
    out.put_slice(&pkt.payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> AudioPacket {
        AudioPacket {
            session_id: "abc".to_string(),
            seq: 1,
            tts_ts: 1000,
            playback_ts: 1000,
            format: AudioFormat::Pcm,
            sample_rate: 44100,
            is_last: false,
            payload: Bytes::from_static(&[0u8; 40]),
        }
    }

    #[test]
    fn round_trips_through_wire_format() {
        let pkt = sample_packet();
        let encoded = encode_packet(&pkt);
        let decoded = parse_packet(&encoded).expect("parse");
        assert_eq!(decoded.session_id, pkt.session_id);
        assert_eq!(decoded.seq, pkt.seq);
        assert_eq!(decoded.tts_ts, pkt.tts_ts);
        assert_eq!(decoded.playback_ts, pkt.playback_ts);
        assert_eq!(decoded.format, pkt.format);
        assert_eq!(decoded.sample_rate, pkt.sample_rate);
        assert_eq!(decoded.is_last, pkt.is_last);
        assert_eq!(decoded.payload, pkt.payload);
    }

    #[test]
    fn empty_payload_is_accepted() {
        let mut pkt = sample_packet();
        pkt.payload = Bytes::new();
        let encoded = encode_packet(&pkt);
        let decoded = parse_packet(&encoded).expect("parse");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn too_short_datagram_is_rejected() {
        assert_eq!(parse_packet(&[]), Err(WireParseError::TooShort));
        assert_eq!(parse_packet(&[3, b'a', b'b']), Err(WireParseError::TooShort));
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let pkt = sample_packet();
        let mut encoded = encode_packet(&pkt).to_vec();
        encoded.pop(); // drop one trailing payload byte
        assert_eq!(
            parse_packet(&encoded),
            Err(WireParseError::PayloadLengthMismatch)
        );
    }

    #[test]
    fn unknown_format_tag_is_rejected() {
        let pkt = sample_packet();
        let mut encoded = encode_packet(&pkt).to_vec();
        // format tag is the byte right after sid_len(1) + sid(3) + seq(4) + tts(8) + playback(8)
        let fmt_offset = 1 + 3 + 4 + 8 + 8;
        encoded[fmt_offset] = 99;
        assert_eq!(parse_packet(&encoded), Err(WireParseError::UnknownFormat));
    }

    #[test]
    fn invalid_session_id_characters_rejected() {
        let mut pkt = sample_packet();
        pkt.session_id = "bad id!".to_string();
        // Bypass encode_packet's trust in the caller by hand-building the frame.
        let mut out = vec![pkt.session_id.len() as u8];
        out.extend_from_slice(pkt.session_id.as_bytes());
        out.extend_from_slice(&pkt.seq.to_be_bytes());
        out.extend_from_slice(&pkt.tts_ts.to_be_bytes());
        out.extend_from_slice(&pkt.playback_ts.to_be_bytes());
        out.push(AudioFormat::Pcm.to_tag());
        out.extend_from_slice(&pkt.sample_rate.to_be_bytes());
        out.push(0);
        out.extend_from_slice(&(pkt.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&pkt.payload);
        assert_eq!(parse_packet(&out), Err(WireParseError::InvalidSessionId));
    }

    #[test]
    fn sequence_wrap_is_representable() {
        let mut pkt = sample_packet();
        pkt.seq = u32::MAX;
        let encoded = encode_packet(&pkt);
        let decoded = parse_packet(&encoded).expect("parse");
        assert_eq!(decoded.seq, u32::MAX);
    }
}
