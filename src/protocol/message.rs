use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use uuid::Uuid;

/// sequence number / ack value for 'nothing', e.g. an ack before any message was received
pub const UNSET_SEQUENCE: i64 = -1;

static HEADER_CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageFlags {
    Send = 0,
    Ack = 1,
    Goodbye = 2,
    Handshake = 3,
    HandshakeOk = 4,
    HandshakeFail = 5,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated header: frame has {actual} bytes, the header requires {required}")]
    TruncatedHeader { actual: usize, required: usize },
    #[error("unknown message flag {0}")]
    UnknownFlag(u8),
    #[error("header checksum mismatch: expected {expected:08x}, was {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("{flags:?} message must not carry a payload")]
    UnexpectedPayload { flags: MessageFlags },
    #[error("invalid sequence number {sequence}")]
    InvalidSequence { sequence: i64 },
    #[error("session id mismatch: expected {expected}, was {actual}")]
    SessionMismatch { expected: Uuid, actual: Uuid },
}

/// The wire unit of the protocol. See the crate documentation for the binary layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub session_id: Uuid,
    pub flags: MessageFlags,
    pub sequence: i64,
    pub ack_sequence: i64,
    /// only non-empty for SEND messages
    pub payload: Bytes,
}

impl ProtocolMessage {
    /// header length up to (excluding) the checksum
    const CHECKSUMMED_LEN: usize = 16 + size_of::<u8>() + 2*size_of::<i64>();
    pub const HEADER_LEN: usize = Self::CHECKSUMMED_LEN + size_of::<u32>();

    pub fn send(session_id: Uuid, sequence: i64, ack_sequence: i64, payload: Bytes) -> ProtocolMessage {
        debug_assert!(sequence >= 0);
        ProtocolMessage {
            session_id,
            flags: MessageFlags::Send,
            sequence,
            ack_sequence,
            payload,
        }
    }

    pub fn ack(session_id: Uuid, ack_sequence: i64) -> ProtocolMessage {
        Self::control(session_id, MessageFlags::Ack, ack_sequence)
    }

    pub fn goodbye(session_id: Uuid) -> ProtocolMessage {
        Self::control(session_id, MessageFlags::Goodbye, UNSET_SEQUENCE)
    }

    /// `previous_handshakes` is the number of handshakes the client completed for this session
    ///  before. It travels in the sequence field and tells a server that lost track of the
    ///  session whether this is a brand-new session (0) or a restore attempt.
    pub fn handshake(session_id: Uuid, previous_handshakes: i64, ack_sequence: i64) -> ProtocolMessage {
        ProtocolMessage {
            sequence: previous_handshakes,
            ..Self::control(session_id, MessageFlags::Handshake, ack_sequence)
        }
    }

    pub fn handshake_ok(session_id: Uuid, ack_sequence: i64) -> ProtocolMessage {
        Self::control(session_id, MessageFlags::HandshakeOk, ack_sequence)
    }

    pub fn handshake_fail(session_id: Uuid) -> ProtocolMessage {
        Self::control(session_id, MessageFlags::HandshakeFail, UNSET_SEQUENCE)
    }

    fn control(session_id: Uuid, flags: MessageFlags, ack_sequence: i64) -> ProtocolMessage {
        ProtocolMessage {
            session_id,
            flags,
            sequence: UNSET_SEQUENCE,
            ack_sequence,
            payload: Bytes::new(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let header_start = buf.len();

        buf.put_slice(self.session_id.as_bytes());
        buf.put_u8(self.flags.into());
        buf.put_i64(self.sequence);
        buf.put_i64(self.ack_sequence);

        let checksum = checksum(&buf[header_start..], &self.payload);
        buf.put_u32(checksum);
        buf.put_slice(&self.payload);
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decodes a frame. The payload of a SEND message shares the frame's buffer rather than
    ///  being copied.
    pub fn parse(frame: Bytes) -> Result<ProtocolMessage, ProtocolError> {
        if frame.len() < Self::HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader {
                actual: frame.len(),
                required: Self::HEADER_LEN,
            });
        }

        let mut header = &frame[..Self::HEADER_LEN];
        let mut raw_session_id = [0u8; 16];
        header.copy_to_slice(&mut raw_session_id);
        let raw_flags = header.get_u8();
        let sequence = header.get_i64();
        let ack_sequence = header.get_i64();
        let expected_checksum = header.get_u32();

        let payload = frame.slice(Self::HEADER_LEN..);

        let actual_checksum = checksum(&frame[..Self::CHECKSUMMED_LEN], &payload);
        if actual_checksum != expected_checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let flags = MessageFlags::try_from(raw_flags)
            .map_err(|_| ProtocolError::UnknownFlag(raw_flags))?;

        match flags {
            MessageFlags::Send => {
                if sequence < 0 {
                    return Err(ProtocolError::InvalidSequence { sequence });
                }
            }
            _ => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload { flags });
                }
            }
        }
        if ack_sequence < UNSET_SEQUENCE {
            return Err(ProtocolError::InvalidSequence { sequence: ack_sequence });
        }

        Ok(ProtocolMessage {
            session_id: Uuid::from_bytes(raw_session_id),
            flags,
            sequence,
            ack_sequence,
            payload,
        })
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut digest = HEADER_CHECKSUM.digest();
    digest.update(header);
    digest.update(payload);
    digest.finalize()
}
