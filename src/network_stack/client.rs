use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, Instrument, Span};
use uuid::Uuid;
use crate::config::ReconnectConfig;
use crate::protocol::send_state::SendError;
use crate::session::{OooSession, Role, SessionListener};
use crate::timer::TokioTimerService;
use crate::transport::tcp::{drive_connection, TcpFrameChannel};
use crate::util::exponential_backoff::ExponentialBackoff;

/// Supplies new physical connections to a client session. A failed attempt is retried by the
///  client, backing off exponentially.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<TcpStream>;
}

/// Connects to a fixed address
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> TcpConnector {
        TcpConnector {
            addr,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> anyhow::Result<TcpStream> {
        match TcpStream::connect(self.addr).await {
            Ok(stream) => Ok(stream),
            Err(e) => bail!("connecting to {} failed: {}", self.addr, e),
        }
    }
}

/// The client side of a logical session: it owns the session, and keeps dialing for as long
///  as the session is not terminated.
pub struct OooClient {
    session: Arc<OooSession>,
    dial_handle: JoinHandle<()>,
}

impl Drop for OooClient {
    fn drop(&mut self) {
        self.dial_handle.abort();
    }
}

impl OooClient {
    /// Starts a new logical session with a fresh session id
    pub async fn start(config: ReconnectConfig, connector: Arc<dyn Connector>, listener: Arc<dyn SessionListener>) -> anyhow::Result<OooClient> {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        Self::start_with_backoff(config, connector, listener, backoff).await
    }

    /// Like [OooClient::start], with a custom delay between connection attempts that fail or that
    ///  are closed before completing the handshake
    pub async fn start_with_backoff(config: ReconnectConfig, connector: Arc<dyn Connector>, listener: Arc<dyn SessionListener>, backoff: ExponentialBackoff) -> anyhow::Result<OooClient> {
        let session_id = Uuid::new_v4();
        let max_frame_len = config.max_frame_len;
        let session = OooSession::new(Role::Client, session_id, config, listener, TokioTimerService::new_shared())?;

        info!("starting client session {}", session_id);
        let dial_handle = tokio::spawn(
            dial_loop(session.clone(), connector, max_frame_len, backoff)
                .instrument(Span::current())
        );

        Ok(OooClient {
            session,
            dial_handle,
        })
    }

    pub fn session(&self) -> &Arc<OooSession> {
        &self.session
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id()
    }

    pub async fn send(&self, payload: Bytes) -> Result<i64, SendError> {
        self.session.send(payload).await
    }

    pub async fn try_send(&self, payload: Bytes) -> Result<i64, SendError> {
        self.session.try_send(payload).await
    }

    /// terminates the session, saying GOODBYE to the server
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Drops the current physical connection. If `forced` is `false`, the client dials again and
    ///  restores the session.
    pub async fn disconnect(&self, forced: bool) {
        self.session.disconnect(forced).await;
    }
}

/// The backoff is reset only by a completed handshake: a peer that accepts TCP connections
///  but rejects the handshake must not be redialed in a tight loop.
#[instrument(name="client_session", skip_all, fields(session_id = %session.session_id()))]
async fn dial_loop(session: Arc<OooSession>, connector: Arc<dyn Connector>, max_frame_len: usize, mut backoff: ExponentialBackoff) {
    while !session.is_terminated() {
        let handshake_completed = match connector.connect().await {
            Ok(stream) => match TcpFrameChannel::new(stream, max_frame_len) {
                Ok((reader, channel)) => {
                    debug!("connected to {}", channel.peer_addr());
                    drive_connection(session.clone(), reader, channel, max_frame_len, None)
                        .instrument(Span::current())
                        .await
                }
                Err(e) => {
                    debug!("error setting up connection: {}", e);
                    false
                }
            }
            Err(e) => {
                debug!("no connection: {}", e);
                false
            }
        };

        if handshake_completed {
            backoff.reset();
        }
        else if !session.is_terminated() {
            let delay = backoff.next_delay();
            debug!("retrying in {:?}", delay);
            time::sleep(delay).await;
        }
    }
    debug!("session terminated - dial loop stopped");
}
