//! Wiring of sessions to TCP: the client dials (and redials while a session can still be
//!  restored), the server accepts connections and routes them to sessions by their handshake.

pub mod client;
pub mod server;
