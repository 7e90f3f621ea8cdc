use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};
use crate::session::OooSession;
use crate::transport::framing::{read_frame, write_frame};
use crate::transport::FrameChannel;

struct ChannelState {
    close_notify: Notify,
    is_closed: AtomicBool,
    is_forced: AtomicBool,
}
impl ChannelState {
    fn close(&self, forced: bool) {
        if forced {
            self.is_forced.store(true, Ordering::Release);
        }
        if !self.is_closed.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit if the read loop is not waiting right now
            self.close_notify.notify_one();
        }
    }
}

/// The sending half of a TCP connection. Frames are handed to a dedicated writer task, so
///  sending never waits for the socket: a session transmits while holding its state lock, and
///  a peer that stops reading must not be able to stall it.
pub struct TcpFrameChannel {
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: Arc<ChannelState>,
}

impl TcpFrameChannel {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> anyhow::Result<(OwnedReadHalf, Arc<TcpFrameChannel>)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState {
            close_notify: Notify::new(),
            is_closed: AtomicBool::new(false),
            is_forced: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(writer, outbound_recv, max_frame_len, state.clone(), peer_addr));

        Ok((reader, Arc::new(TcpFrameChannel {
            peer_addr,
            outbound,
            state,
        })))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed.load(Ordering::Acquire)
    }

    fn is_forced(&self) -> bool {
        self.state.is_forced.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FrameChannel for TcpFrameChannel {
    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<usize> {
        if self.is_closed() {
            return Err(anyhow!("connection to {} is closed", self.peer_addr));
        }
        let len = frame.len();
        self.outbound.send(frame)
            .map_err(|_| anyhow!("connection to {} is broken", self.peer_addr))?;
        Ok(len)
    }

    fn close(&self, forced: bool) {
        debug!("closing connection to {} (forced: {})", self.peer_addr, forced);
        self.state.close(forced);
    }
}

/// Writes frames until all senders are gone, i.e. frames that were accepted before a close
///  (like a GOODBYE) still go out.
async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>, max_frame_len: usize, state: Arc<ChannelState>, peer_addr: SocketAddr) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, max_frame_len).await {
            debug!("error writing to {}: {} - closing the connection", peer_addr, e);
            state.close(false);
            return;
        }
    }
    trace!("write loop for {} terminated", peer_addr);
    let _ = writer.shutdown().await;
}

/// Pumps frames from a physical connection into a session until either side closes it, and
///  reports the connection's lifecycle to the session. `first_frame` is a frame that was read
///  before the session was known, i.e. a server's initial HANDSHAKE.
///
/// Returns `true` if the connection completed the handshake.
pub async fn drive_connection<R: AsyncRead + Unpin>(session: Arc<OooSession>, mut reader: R, channel: Arc<TcpFrameChannel>, max_frame_len: usize, first_frame: Option<Bytes>) -> bool {
    let connection_id = match session.on_connected(channel.clone()).await {
        Ok(id) => id,
        Err(e) => {
            debug!("session {} rejected connection from {}: {}", session.session_id(), channel.peer_addr(), e);
            channel.close(false);
            return false;
        }
    };
    let handshakes_before = session.completed_handshakes().await;

    if let Some(frame) = first_frame {
        if let Err(e) = session.on_frame_received(connection_id, frame).await {
            warn!("closing connection to {}: {}", channel.peer_addr(), e);
            channel.close(false);
        }
    }

    while !channel.is_closed() {
        select! {
            _ = channel.state.close_notify.notified() => {
                break;
            }
            frame = read_frame(&mut reader, max_frame_len) => {
                match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = session.on_frame_received(connection_id, frame).await {
                            warn!("closing connection to {}: {}", channel.peer_addr(), e);
                            channel.close(false);
                        }
                    }
                    Ok(None) => {
                        debug!("connection closed by {}", channel.peer_addr());
                        channel.close(false);
                    }
                    Err(e) => {
                        debug!("error reading from {}: {}", channel.peer_addr(), e);
                        channel.close(false);
                    }
                }
            }
        }
    }

    let handshake_completed = session.completed_handshakes().await > handshakes_before;
    session.on_disconnected(connection_id, channel.is_forced()).await;
    handshake_completed
}
