//! VoMP frame payloads.
//!
//! Frame kind 0x01 is a state report that may carry either pre-call setup
//! data (the sender's codec bitmap and the dialled numbers) or in-call
//! audio (a 32-bit audio clock, the codec id, and samples). Everything is
//! big-endian; sessions are 24-bit.

use crate::codecs::CodecFlags;
use crate::error::VompError;

pub const FRAME_STATE: u8 = 0x01;
pub const HEADER_BYTES: usize = 14;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateFrame {
    /// `(remote_state << 4) | local_state` as the sender sees the call.
    pub states: u8,
    /// Sender's view of the recipient's sequence.
    pub recipient_sequence: u16,
    pub sender_sequence: u16,
    /// Milliseconds since the sender created the call, low 16 bits.
    pub call_millis: u16,
    pub recipient_session: u32,
    pub sender_session: u32,
    /// Pre-call setup or audio, raw; interpreted by call state.
    pub tail: Vec<u8>,
}

impl StateFrame {
    pub fn sender_state(&self) -> u8 {
        self.states & 0x0F
    }

    pub fn claimed_recipient_state(&self) -> u8 {
        self.states >> 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.tail.len());
        out.push(FRAME_STATE);
        out.push(self.states);
        out.extend_from_slice(&self.recipient_sequence.to_be_bytes());
        out.extend_from_slice(&self.sender_sequence.to_be_bytes());
        out.extend_from_slice(&self.call_millis.to_be_bytes());
        out.extend_from_slice(&self.recipient_session.to_be_bytes()[1..]);
        out.extend_from_slice(&self.sender_session.to_be_bytes()[1..]);
        out.extend_from_slice(&self.tail);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, VompError> {
        if payload.is_empty() {
            return Err(VompError::Parse("empty frame".into()));
        }
        if payload[0] != FRAME_STATE {
            return Err(VompError::UnsupportedFrame(payload[0]));
        }
        if payload.len() < HEADER_BYTES {
            return Err(VompError::Parse(format!(
                "state frame of {} bytes is shorter than the {HEADER_BYTES} byte header",
                payload.len()
            )));
        }
        let u24 = |bytes: &[u8]| {
            (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
        };
        Ok(Self {
            states: payload[1],
            recipient_sequence: u16::from_be_bytes([payload[2], payload[3]]),
            sender_sequence: u16::from_be_bytes([payload[4], payload[5]]),
            call_millis: u16::from_be_bytes([payload[6], payload[7]]),
            recipient_session: u24(&payload[8..11]),
            sender_session: u24(&payload[11..14]),
            tail: payload[HEADER_BYTES..].to_vec(),
        })
    }
}

/// Pre-call tail: a zero-terminated codec id list, then (from the party
/// that initiated the call) the source and destination numbers, each
/// NUL-terminated.
pub fn encode_precall(codecs: &CodecFlags, dids: Option<(&str, &str)>) -> Vec<u8> {
    let mut out = Vec::new();
    for codec in codecs.iter() {
        if codec != 0 {
            out.push(codec);
        }
    }
    out.push(0);
    if let Some((src_did, dst_did)) = dids {
        out.extend_from_slice(src_did.as_bytes());
        out.push(0);
        out.extend_from_slice(dst_did.as_bytes());
        out.push(0);
    }
    out
}

pub struct Precall {
    pub codecs: CodecFlags,
    pub dids: Option<(String, String)>,
}

pub fn decode_precall(tail: &[u8]) -> Precall {
    let mut codecs = CodecFlags::new();
    let mut offset = 0;
    while offset < tail.len() && tail[offset] != 0 {
        codecs.set(tail[offset]);
        offset += 1;
    }
    offset += 1;

    let mut read_did = |offset: &mut usize| -> Option<String> {
        if *offset >= tail.len() {
            return None;
        }
        let rest = &tail[*offset..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let did = String::from_utf8_lossy(&rest[..end]).into_owned();
        *offset += end + 1;
        Some(did)
    };
    let dids = match (read_did(&mut offset), read_did(&mut offset)) {
        (Some(src), Some(dst)) => Some((src, dst)),
        _ => None,
    };
    Precall { codecs, dids }
}

/// In-call audio tail.
pub struct AudioChunk<'a> {
    pub audio_clock: u32,
    pub codec: u8,
    pub samples: &'a [u8],
}

pub fn encode_audio(audio_clock: u32, codec: u8, samples: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + samples.len());
    out.extend_from_slice(&audio_clock.to_be_bytes());
    out.push(codec);
    out.extend_from_slice(samples);
    out
}

pub fn decode_audio(tail: &[u8]) -> Result<AudioChunk<'_>, VompError> {
    if tail.len() < 5 {
        return Err(VompError::Parse("audio tail shorter than its header".into()));
    }
    Ok(AudioChunk {
        audio_clock: u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]),
        codec: tail[4],
        samples: &tail[5..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::{CODEC_DTMF, CODEC_GSM_FULL, CODEC_PCM};

    #[test]
    fn state_frame_roundtrip() {
        let frame = StateFrame {
            states: 0x35,
            recipient_sequence: 0x0102,
            sender_sequence: 0xFFFE,
            call_millis: 12_345,
            recipient_session: 0xABCDEF,
            sender_session: 0x123456,
            tail: vec![9, 9, 9],
        };
        let decoded = StateFrame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
        assert_eq!(decoded.sender_state(), 5);
        assert_eq!(decoded.claimed_recipient_state(), 3);
    }

    #[test]
    fn sessions_are_24_bit() {
        let frame = StateFrame {
            states: 0,
            recipient_sequence: 0,
            sender_sequence: 0,
            call_millis: 0,
            recipient_session: 0xFFFFFF,
            sender_session: 1,
            tail: Vec::new(),
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_BYTES);
        assert_eq!(&bytes[8..11], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[11..14], &[0x00, 0x00, 0x01]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            StateFrame::decode(&[0x7F, 0, 0]),
            Err(VompError::UnsupportedFrame(0x7F))
        ));
        assert!(StateFrame::decode(&[FRAME_STATE, 0, 0]).is_err());
    }

    #[test]
    fn precall_roundtrip_with_numbers() {
        let codecs = CodecFlags::of(&[CODEC_PCM, CODEC_GSM_FULL, CODEC_DTMF]);
        let tail = encode_precall(&codecs, Some(("5551", "5552")));
        let parsed = decode_precall(&tail);
        assert!(parsed.codecs.contains(CODEC_PCM));
        assert!(parsed.codecs.contains(CODEC_DTMF));
        assert_eq!(parsed.dids, Some(("5551".into(), "5552".into())));
    }

    #[test]
    fn precall_without_numbers() {
        let tail = encode_precall(&CodecFlags::of(&[CODEC_PCM]), None);
        let parsed = decode_precall(&tail);
        assert!(parsed.codecs.contains(CODEC_PCM));
        assert!(parsed.dids.is_none());
    }

    #[test]
    fn audio_roundtrip() {
        let tail = encode_audio(123_456, CODEC_PCM, &[1, 2, 3]);
        let chunk = decode_audio(&tail).expect("decode");
        assert_eq!(chunk.audio_clock, 123_456);
        assert_eq!(chunk.codec, CODEC_PCM);
        assert_eq!(chunk.samples, &[1, 2, 3]);
    }
}
