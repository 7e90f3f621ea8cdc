use std::time::Duration;
use anyhow::bail;
use tracing::warn;
use crate::protocol::message::ProtocolMessage;
use crate::util::safe_converter::PrecheckedCast;

/// Configuration of a logical session. It is supplied at construction, validated once and
///  immutable afterwards.
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// If this is `false`, every loss of the physical connection terminates the logical session
    pub reconnect_enabled: bool,

    /// The length of the restore window, i.e. the time a dropped physical connection may be
    ///  replaced by a new one before the logical session is treated as permanently lost
    pub reconnect_timeout: Duration,

    /// The maximum number of messages that are accepted for sending (and assigned a sequence
    ///  number) while there is no physical connection to transmit them
    pub send_queue_cap: usize,

    /// The receiver sends an explicit ACK after this many in-order messages. This trades ack
    ///  traffic for a bigger retransmission on reconnect.
    ///
    /// Must be positive and smaller than `send_window`, otherwise the sender can block on a full
    ///  window waiting for an ack the receiver is not going to send.
    pub max_delayed_acks: i64,

    /// This is the maximum number of *messages* retained on the sender side pending an ack.
    ///  Values `<= 0` disable throttling.
    pub send_window: i64,

    /// Pending (delayed) acks are flushed at this interval if there is no traffic that carries
    ///  them. `None` disables idle flushing.
    pub idle_ack_flush_interval: Option<Duration>,

    /// upper bound for the length of a single frame on the wire, including the protocol header
    pub max_frame_len: usize,

    /// a new physical connection that does not complete the handshake in this time is dropped
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            reconnect_enabled: true,
            reconnect_timeout: Duration::from_secs(5),
            send_queue_cap: 5000,
            max_delayed_acks: 16,
            send_window: 32,
            idle_ack_flush_interval: Some(Duration::from_millis(100)),
            max_frame_len: 16*1024*1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_delayed_acks <= 0 {
            bail!("max_delayed_acks must be positive, was {}", self.max_delayed_acks);
        }

        if self.send_window <= 0 {
            warn!("send window is {} - the sender will never throttle", self.send_window);
        }
        else if self.max_delayed_acks >= self.send_window {
            bail!("max_delayed_acks ({}) must be smaller than send_window ({})", self.max_delayed_acks, self.send_window);
        }

        if self.send_queue_cap == 0 {
            bail!("send_queue_cap must be positive");
        }

        if self.max_frame_len < ProtocolMessage::HEADER_LEN {
            bail!("max_frame_len ({}) does not fit the protocol header of {} bytes", self.max_frame_len, ProtocolMessage::HEADER_LEN);
        }
        if u32::try_from(self.max_frame_len).is_err() {
            bail!("max_frame_len ({}) exceeds the range of the u32 length prefix", self.max_frame_len);
        }

        Ok(())
    }

    /// `None` if the sender never throttles
    pub fn effective_send_window(&self) -> Option<usize> {
        if self.send_window <= 0 {
            None
        }
        else {
            Some(self.send_window.prechecked_cast())
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn config(max_delayed_acks: i64, send_window: i64) -> ReconnectConfig {
        ReconnectConfig {
            max_delayed_acks,
            send_window,
            ..ReconnectConfig::default()
        }
    }

    #[rstest]
    #[case::regular(16, 32, true)]
    #[case::just_below(15, 16, true)]
    #[case::minimal(1, 2, true)]
    #[case::equal(16, 16, false)]
    #[case::delayed_acks_above_window(16, 8, false)]
    #[case::zero_delayed_acks(0, 32, false)]
    #[case::negative_delayed_acks(-1, 32, false)]
    #[case::unthrottled_zero(16, 0, true)]
    #[case::unthrottled_negative(16, -5, true)]
    #[case::unthrottled_zero_delayed_acks(0, 0, false)]
    fn test_validate_ack_window(#[case] max_delayed_acks: i64, #[case] send_window: i64, #[case] expected_ok: bool) {
        assert_eq!(config(max_delayed_acks, send_window).validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_validate_default() {
        ReconnectConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_send_queue_cap() {
        let config = ReconnectConfig {
            send_queue_cap: 0,
            ..ReconnectConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::too_short(ProtocolMessage::HEADER_LEN - 1, false)]
    #[case::header_only(ProtocolMessage::HEADER_LEN, true)]
    #[case::u32_max(u32::MAX as usize, true)]
    fn test_validate_max_frame_len(#[case] max_frame_len: usize, #[case] expected_ok: bool) {
        let config = ReconnectConfig {
            max_frame_len,
            ..ReconnectConfig::default()
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    #[case::bounded(32, Some(32))]
    #[case::zero(0, None)]
    #[case::negative(-1, None)]
    fn test_effective_send_window(#[case] send_window: i64, #[case] expected: Option<usize>) {
        assert_eq!(config(1, send_window).effective_send_window(), expected);
    }
}
