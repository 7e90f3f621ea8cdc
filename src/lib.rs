//! A reliable message-delivery layer that keeps a *logical session* alive across reconnects of
//!  the underlying *physical* TCP connection. Physical connections may drop and be replaced
//!  (network blips, GC pauses, proxy failover), while the upper layer sees message delivery
//!  that is in order, exactly once and without gaps ('once and only once').
//!
//! ## Design goals
//!
//! * Every message gets a sequence number, per direction and per logical session
//!   * the sender retains messages until they are acknowledged, in a bounded send window
//!   * when the window is full, sending waits (or fails for the non-blocking variant) rather
//!      than dropping messages
//! * The receiver delivers each message exactly once, and in order
//!   * duplicates (re-sent after a reconnect) and gaps are answered with an ack for the last
//!      delivered message, which is idempotent
//!   * acks are delayed and batched: an explicit ACK is sent only after a configurable number of
//!      messages, and every message in the opposite direction carries the current ack
//!   * pending acks are flushed periodically if there is no traffic
//! * After a reconnect, the sender replays its entire unacked window with the original sequence
//!    numbers, and the receiver's dedup absorbs what it already has
//! * A lost physical connection opens a *restore window*. If a new physical connection completes
//!    the handshake before the window expires, the session resumes, otherwise it is lost for
//!    good and the upper layer is notified
//!   * an intentional ('forced') disconnect skips the restore window
//!   * there is no delivery guarantee across a process restart of either side
//! * No encryption, no interpretation of application payloads
//!
//! ## Wire format
//!
//! Frames are length-prefixed on the TCP stream (`len` excluding itself), and each frame
//!  carries a single protocol message. All numbers are big endian:
//!
//! ```ascii
//!  0: frame length (u32)
//!  4: session id (16 bytes, UUID)
//! 20: flags (u8): 0 SEND, 1 ACK, 2 GOODBYE, 3 HANDSHAKE, 4 HANDSHAKE_OK, 5 HANDSHAKE_FAIL
//! 21: sequence number (i64) - -1 for anything but SEND and HANDSHAKE
//! 29: ack sequence number (i64) - highest contiguous sequence number received, -1 for none
//! 37: CRC-32 (Castagnoli) of header and payload (u32)
//! 41: payload (SEND messages only)
//! ```
//!
//! ## Handshake
//!
//! Every new physical connection starts with a handshake before any messages are exchanged.
//!  The client sends HANDSHAKE with the session id and its current ack, and with the number of
//!  handshakes it completed for this session before in the sequence field. The server either
//!  creates a new session, resumes the existing session with that id, or rejects the attempt
//!  with HANDSHAKE_FAIL (e.g. for a session that was terminated in the meantime). HANDSHAKE_OK
//!  carries the server's ack, and both sides then replay their unacked messages.
//!
//! A session ends with GOODBYE from either side, or when its restore window expires.

pub mod config;
pub mod network_stack;
pub mod protocol;
pub mod session;
pub mod test_util;
pub mod timer;
pub mod transport;
pub mod util;
