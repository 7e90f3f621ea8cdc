use std::collections::VecDeque;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use crate::config::ReconnectConfig;
use crate::protocol::message::{ProtocolMessage, UNSET_SEQUENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("the send window is full")]
    WindowFull,
    #[error("the send queue is full while there is no physical connection")]
    QueueFull,
    #[error("the session is terminated")]
    SessionTerminated,
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// The outcome of accepting a message for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// there is a physical connection, and the message should be transmitted right away
    Transmit(i64),
    /// no physical connection - the message is retained and will go out with the next replay
    Deferred(i64),
}
impl Enqueued {
    pub fn sequence(&self) -> i64 {
        match *self {
            Enqueued::Transmit(sequence) => sequence,
            Enqueued::Deferred(sequence) => sequence,
        }
    }
}

struct UnackedMessage {
    sequence: i64,
    payload: Bytes,
}

/// The sender's side of one logical session: it assigns sequence numbers, retains messages
///  until they are acknowledged, and replays them after a reconnect.
///
/// Invariant: `unacked` holds a contiguous range of sequence numbers ending at
///  `next_sequence - 1`, and its size never exceeds the send window.
pub struct SendStateMachine {
    session_id: Uuid,
    next_sequence: i64,
    /// highest ack processed so far - lower acks are outdated and ignored
    highest_ack: i64,
    unacked: VecDeque<UnackedMessage>,
    /// number of messages at the end of `unacked` that were never transmitted
    num_unsent: usize,
    is_channel_up: bool,

    send_window: Option<usize>,
    send_queue_cap: usize,
    max_payload_len: usize,
}

impl SendStateMachine {
    pub fn new(session_id: Uuid, config: &ReconnectConfig) -> SendStateMachine {
        SendStateMachine {
            session_id,
            next_sequence: 0,
            highest_ack: UNSET_SEQUENCE,
            unacked: VecDeque::new(),
            num_unsent: 0,
            is_channel_up: false,
            send_window: config.effective_send_window(),
            send_queue_cap: config.send_queue_cap,
            max_payload_len: config.max_frame_len.saturating_sub(ProtocolMessage::HEADER_LEN),
        }
    }

    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    pub fn num_unacked(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacked_sequences(&self) -> Vec<i64> {
        self.unacked.iter()
            .map(|msg| msg.sequence)
            .collect()
    }

    /// Accepts a message, assigning the next sequence number. This fails rather than dropping
    ///  a message if the window (or, while disconnected, the send queue) is full.
    pub fn try_send(&mut self, payload: Bytes) -> Result<Enqueued, SendError> {
        if payload.len() > self.max_payload_len {
            return Err(SendError::PayloadTooLarge { len: payload.len(), max: self.max_payload_len });
        }
        if let Some(send_window) = self.send_window {
            if self.unacked.len() >= send_window {
                trace!("send window of {} is full", send_window);
                return Err(SendError::WindowFull);
            }
        }
        if !self.is_channel_up && self.num_unsent >= self.send_queue_cap {
            trace!("send queue of {} is full", self.send_queue_cap);
            return Err(SendError::QueueFull);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.unacked.push_back(UnackedMessage { sequence, payload });

        if self.is_channel_up {
            Ok(Enqueued::Transmit(sequence))
        }
        else {
            self.num_unsent += 1;
            Ok(Enqueued::Deferred(sequence))
        }
    }

    /// Retires all messages up to and including `ack_sequence`. Returns the number of retired
    ///  messages, i.e. the capacity that became available in the send window.
    pub fn on_ack(&mut self, ack_sequence: i64) -> usize {
        if ack_sequence <= self.highest_ack {
            trace!("ignoring outdated ack #{} (already processed #{})", ack_sequence, self.highest_ack);
            return 0;
        }

        let ack_sequence = if ack_sequence >= self.next_sequence {
            warn!("peer acked #{} which was never sent (highest is #{}) - ignoring the excess", ack_sequence, self.next_sequence - 1);
            self.next_sequence - 1
        }
        else {
            ack_sequence
        };
        self.highest_ack = ack_sequence;

        let mut num_retired = 0;
        while let Some(oldest) = self.unacked.front() {
            if oldest.sequence > ack_sequence {
                break;
            }
            self.unacked.pop_front();
            num_retired += 1;
        }
        self.num_unsent = self.num_unsent.min(self.unacked.len());

        trace!("ack #{} retired {} messages, {} remaining", ack_sequence, num_retired, self.unacked.len());
        num_retired
    }

    pub fn on_channel_down(&mut self) {
        self.is_channel_up = false;
    }

    /// Called when a new physical connection completed its handshake: returns the entire
    ///  unacked window, oldest first and with its original sequence numbers, for re-sending.
    pub fn on_reconnect(&mut self, ack_sequence: i64) -> Vec<ProtocolMessage> {
        self.is_channel_up = true;
        self.num_unsent = 0;

        if !self.unacked.is_empty() {
            debug!("replaying {} unacked messages #{}..#{}", self.unacked.len(), self.unacked[0].sequence, self.next_sequence - 1);
        }

        self.unacked.iter()
            .map(|msg| ProtocolMessage::send(self.session_id, msg.sequence, ack_sequence, msg.payload.clone()))
            .collect()
    }

    /// Only for starting a new logical session
    pub fn reset(&mut self, session_id: Uuid) {
        self.session_id = session_id;
        self.next_sequence = 0;
        self.highest_ack = UNSET_SEQUENCE;
        self.unacked.clear();
        self.num_unsent = 0;
    }
}
