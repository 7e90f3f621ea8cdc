use tracing::{debug, trace};
use crate::protocol::message::UNSET_SEQUENCE;

/// The receiver's bookkeeping for one logical session.
///
/// Invariant: `last_acked <= received`, and `received` never decreases during the lifetime of a
///  logical session - physical reconnects leave it untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveTracker {
    /// highest contiguous sequence number delivered to the application
    pub received: i64,
    /// highest sequence number for which an ACK was sent
    pub last_acked: i64,
}

impl ReceiveTracker {
    pub const INITIAL: ReceiveTracker = ReceiveTracker {
        received: UNSET_SEQUENCE,
        last_acked: UNSET_SEQUENCE,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveAction {
    /// The message is the next in sequence: deliver its payload. `ack` is set if the delayed
    ///  ack threshold was reached and an ACK for this value must be sent.
    Deliver { ack: Option<i64> },
    /// already delivered: re-ack so the sender can retire it
    DuplicateAck(i64),
    /// some earlier message is missing: re-ack so the sender resumes from there
    GapAck(i64),
}

/// The receive automaton as a pure function of the tracker and an incoming SEND message's
///  sequence number.
///
/// Duplicates and gaps are both 'not the next message', and they are told apart by comparing
///  with `received` before anything is updated.
pub fn on_send_message(tracker: ReceiveTracker, sequence: i64, max_delayed_acks: i64) -> (ReceiveTracker, ReceiveAction) {
    let acked_everything = ReceiveTracker {
        received: tracker.received,
        last_acked: tracker.received,
    };

    if sequence <= tracker.received {
        return (acked_everything, ReceiveAction::DuplicateAck(tracker.received));
    }
    if sequence > tracker.received + 1 {
        return (acked_everything, ReceiveAction::GapAck(tracker.received));
    }

    if sequence - tracker.last_acked >= max_delayed_acks {
        (ReceiveTracker { received: sequence, last_acked: sequence }, ReceiveAction::Deliver { ack: Some(sequence) })
    }
    else {
        (ReceiveTracker { received: sequence, last_acked: tracker.last_acked }, ReceiveAction::Deliver { ack: None })
    }
}

pub struct ReceiveStateMachine {
    tracker: ReceiveTracker,
    max_delayed_acks: i64,
}

impl ReceiveStateMachine {
    pub fn new(max_delayed_acks: i64) -> ReceiveStateMachine {
        ReceiveStateMachine {
            tracker: ReceiveTracker::INITIAL,
            max_delayed_acks,
        }
    }

    pub fn received(&self) -> i64 {
        self.tracker.received
    }

    pub fn last_acked(&self) -> i64 {
        self.tracker.last_acked
    }

    pub fn on_send_message(&mut self, sequence: i64) -> ReceiveAction {
        let (tracker, action) = on_send_message(self.tracker, sequence, self.max_delayed_acks);
        match action {
            ReceiveAction::Deliver { ack } => trace!("message #{} is in sequence, ack: {:?}", sequence, ack),
            ReceiveAction::DuplicateAck(ack) => debug!("message #{} is a duplicate - re-acking #{}", sequence, ack),
            ReceiveAction::GapAck(ack) => debug!("message #{} arrived before #{} - re-acking #{}", sequence, ack + 1, ack),
        }
        self.tracker = tracker;
        action
    }

    /// The ack value to send to the peer. This always flushes delayed acks, i.e. the caller is
    ///  expected to actually send the returned value.
    pub fn ack_sequence(&mut self) -> i64 {
        self.tracker.last_acked = self.tracker.received;
        self.tracker.last_acked
    }

    /// If some delivered messages are not acked yet, flush and return the ack value
    pub fn pending_ack(&mut self) -> Option<i64> {
        if self.tracker.received > self.tracker.last_acked {
            Some(self.ack_sequence())
        }
        else {
            None
        }
    }

    /// Only for starting a new logical session - never on a reconnect
    pub fn reset(&mut self) {
        self.tracker = ReceiveTracker::INITIAL;
    }
}
