//! The physical side of a session: anything that can carry whole frames to the peer.

pub mod framing;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// One physical connection as seen by a session. Frames are sent in the order of the calls.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameChannel: Send + Sync + 'static {
    /// Returns the number of bytes accepted for transmission. An error means the connection
    ///  is broken, and the frame may or may not have reached the peer.
    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<usize>;

    /// Asks the transport to close the connection. The transport reports the closing back to
    ///  the session through `on_disconnected`, passing on the `forced` flag.
    fn close(&self, forced: bool);
}
