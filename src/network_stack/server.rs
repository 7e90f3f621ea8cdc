use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, warn, Instrument, Span};
use uuid::Uuid;
use crate::config::ReconnectConfig;
use crate::protocol::message::{MessageFlags, ProtocolMessage};
use crate::session::{OooSession, Role, SessionListener};
use crate::timer::{TimerService, TokioTimerService};
use crate::transport::framing::read_frame;
use crate::transport::tcp::{drive_connection, TcpFrameChannel};
use crate::transport::FrameChannel;

/// Creates the upper layer for each new logical session the server accepts
pub trait SessionListenerFactory: Send + Sync + 'static {
    fn create_listener(&self, session_id: Uuid) -> Arc<dyn SessionListener>;
}

impl <F> SessionListenerFactory for F
where F: Fn(Uuid) -> Arc<dyn SessionListener> + Send + Sync + 'static
{
    fn create_listener(&self, session_id: Uuid) -> Arc<dyn SessionListener> {
        self(session_id)
    }
}

struct ServerShared {
    config: ReconnectConfig,
    listener_factory: Arc<dyn SessionListenerFactory>,
    timer: Arc<dyn TimerService>,
    sessions: RwLock<FxHashMap<Uuid, Arc<OooSession>>>,
}

impl ServerShared {
    /// Returns `None` if the handshake refers to a session this server does not know and that
    ///  is not new either, i.e. one that was terminated and removed.
    async fn find_or_create_session(self: &Arc<Self>, session_id: Uuid, previous_handshakes: i64) -> anyhow::Result<Option<Arc<OooSession>>> {
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get(&session_id) {
            if !session.is_terminated() {
                return Ok(Some(session.clone()));
            }
            debug!("removing terminated session {}", session_id);
            sessions.remove(&session_id);
        }
        if previous_handshakes != 0 {
            warn!("restore attempt for unknown session {} - rejecting", session_id);
            return Ok(None);
        }

        info!("new session {}", session_id);
        let listener = self.listener_factory.create_listener(session_id);
        let session = OooSession::new(Role::Server, session_id, self.config.clone(), listener, self.timer.clone())?;
        sessions.insert(session_id, session.clone());
        self.remove_when_terminated(&session);
        Ok(Some(session))
    }

    /// Terminated sessions hold on to their unacked messages, so they are removed right away.
    ///  The spawned task holds neither the session nor the server.
    fn remove_when_terminated(self: &Arc<Self>, session: &OooSession) {
        let session_id = session.session_id();
        let mut terminated = session.subscribe_terminated();
        let shared = Arc::downgrade(self);

        tokio::spawn(async move {
            if terminated.wait_for(|is_terminated| *is_terminated).await.is_err() {
                return;
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut sessions = shared.sessions.write().await;
            if matches!(sessions.get(&session_id), Some(session) if session.is_terminated()) {
                debug!("removing terminated session {}", session_id);
                sessions.remove(&session_id);
            }
        });
    }
}

/// The server side of the OOO layer: it accepts TCP connections, and each connection's initial
///  HANDSHAKE decides which logical session it belongs to.
pub struct OooServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_handle: JoinHandle<()>,
}

impl Drop for OooServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

impl OooServer {
    pub async fn bind(addr: SocketAddr, config: ReconnectConfig, listener_factory: Arc<dyn SessionListenerFactory>) -> anyhow::Result<OooServer> {
        config.validate()?;

        let server_socket = TcpListener::bind(addr).await?;
        let local_addr = server_socket.local_addr()?;
        info!("listening on {}", local_addr);

        let shared = Arc::new(ServerShared {
            config,
            listener_factory,
            timer: TokioTimerService::new_shared(),
            sessions: RwLock::new(FxHashMap::default()),
        });

        let accept_handle = tokio::spawn(accept_loop(server_socket, shared.clone()));

        Ok(OooServer {
            local_addr,
            shared,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn session(&self, session_id: &Uuid) -> Option<Arc<OooSession>> {
        self.shared.sessions.read().await
            .get(session_id)
            .cloned()
    }

    /// ids of the sessions that are not terminated
    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.shared.sessions.read().await
            .iter()
            .filter(|(_, session)| !session.is_terminated())
            .map(|(id, _)| *id)
            .collect()
    }
}

async fn accept_loop(server_socket: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match server_socket.accept().await {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(addr, stream, shared).await {
                        warn!("connection from {} broke with an error: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("error accepting connection: {}", e);
            }
        }
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = %addr))]
async fn handle_connection(addr: SocketAddr, stream: TcpStream, shared: Arc<ServerShared>) -> anyhow::Result<()> {
    debug!("received connection request");
    let max_frame_len = shared.config.max_frame_len;
    let (mut reader, channel) = TcpFrameChannel::new(stream, max_frame_len)?;

    let first_frame = match time::timeout(shared.config.handshake_timeout, read_frame(&mut reader, max_frame_len)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!("connection closed before the handshake");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => bail!("no handshake within {:?}", shared.config.handshake_timeout),
    };

    let handshake = ProtocolMessage::parse(first_frame.clone())?;
    if handshake.flags != MessageFlags::Handshake {
        bail!("expected HANDSHAKE, received {:?}", handshake.flags);
    }

    let Some(session) = shared.find_or_create_session(handshake.session_id, handshake.sequence).await? else {
        channel.send_frame(ProtocolMessage::handshake_fail(handshake.session_id).to_frame()).await?;
        channel.close(false);
        return Ok(());
    };

    drive_connection(session, reader, channel, max_frame_len, Some(first_frame))
        .instrument(Span::current())
        .await;
    debug!("connection closed");
    Ok(())
}
