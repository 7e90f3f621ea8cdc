use std::sync::{Arc, Weak};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use crate::config::ReconnectConfig;
use crate::protocol::coordinator::{DisconnectOutcome, HandshakeOutcome, ReconnectCoordinator, SessionLossReason, SessionState};
use crate::protocol::message::{MessageFlags, ProtocolError, ProtocolMessage};
use crate::protocol::receive_state::{ReceiveAction, ReceiveStateMachine};
use crate::protocol::send_state::{Enqueued, SendError, SendStateMachine};
use crate::timer::{TimerHandle, TimerService};
use crate::transport::FrameChannel;

/// Identifies a physical connection within a session. Events from a connection that was
///  replaced or dropped are recognized by their outdated id.
pub type ConnectionId = u64;

/// The client initiates the handshake on every new physical connection, the server answers it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// The upper layer's view of a session. Callbacks are made sequentially, never concurrently,
///  and message payloads arrive in order, without gaps or duplicates.
///
/// NB: Callbacks hold up the processing of incoming frames, so they must not wait for send
///  capacity - a blocking [OooSession::send] from inside a callback can deadlock on an ack
///  that is never processed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    async fn on_message(&self, payload: Bytes);

    /// a new physical connection resumed the session after the previous one was lost
    async fn on_session_restored(&self);

    /// The session is terminated for good. This is called at most once per session.
    async fn on_session_lost(&self, reason: SessionLossReason);
}

enum SessionEvent {
    Message(Bytes),
    Restored,
    Lost(SessionLossReason),
}

/// a physical connection that was established but did not complete the handshake yet
struct PendingConnection {
    id: ConnectionId,
    channel: Arc<dyn FrameChannel>,
    handshake_timer: TimerHandle,
}

struct SessionInner {
    session_id: Uuid,
    send: SendStateMachine,
    receive: ReceiveStateMachine,
    coordinator: ReconnectCoordinator,

    active: Option<(ConnectionId, Arc<dyn FrameChannel>)>,
    pending: Option<PendingConnection>,
    restore_timer: Option<TimerHandle>,

    next_connection_id: ConnectionId,
    completed_handshakes: i64,
}

impl SessionInner {
    fn is_active(&self, connection_id: ConnectionId) -> bool {
        matches!(&self.active, Some((id, _)) if *id == connection_id)
    }

    fn is_pending(&self, connection_id: ConnectionId) -> bool {
        matches!(&self.pending, Some(pending) if pending.id == connection_id)
    }

    /// Frames that can not be sent leave the connection to fail and be replaced - lost SEND
    ///  messages are replayed after the handshake, and lost acks are recomputed.
    async fn transmit(channel: &Arc<dyn FrameChannel>, msg: ProtocolMessage) -> bool {
        match channel.send_frame(msg.to_frame()).await {
            Ok(_) => true,
            Err(e) => {
                debug!("error sending {:?} #{}: {}", msg.flags, msg.sequence, e);
                false
            }
        }
    }

    async fn send_ack(&mut self, ack_sequence: i64) {
        if let Some((_, channel)) = &self.active {
            trace!("sending ACK #{}", ack_sequence);
            Self::transmit(channel, ProtocolMessage::ack(self.session_id, ack_sequence)).await;
        }
    }
}

/// One logical session of the OOO layer: it assigns sequence numbers to outgoing messages,
///  delivers incoming ones exactly once and in order, and survives the loss of the physical
///  connection as long as a new one completes the handshake inside the restore window.
///
/// The session does no I/O of its own. The transport reports physical connections and frames
///  (`on_connected`, `on_frame_received`, `on_disconnected`), and the session sends frames
///  through the [FrameChannel] of the current connection.
///
/// All state transitions happen under a single lock. Transport and timer events additionally
///  hold an 'inbound' lock while they call back into the listener, which keeps deliveries and
///  lifecycle notifications in order without calling out while holding the state lock.
pub struct OooSession {
    role: Role,
    session_id: Uuid,
    config: ReconnectConfig,
    inner: Mutex<SessionInner>,
    inbound: Mutex<()>,

    /// woken whenever send capacity may have become available, or the session terminated
    send_capacity_notify: Notify,
    terminated: watch::Sender<bool>,

    listener: Arc<dyn SessionListener>,
    timer: Arc<dyn TimerService>,
    myself: Weak<OooSession>,

    idle_ack_flush_handle: Option<JoinHandle<()>>,
}

impl Drop for OooSession {
    fn drop(&mut self) {
        if let Some(handle) = self.idle_ack_flush_handle.take() {
            handle.abort();
        }
    }
}

impl OooSession {
    /// Fails if the configuration is invalid. This must be called from inside a tokio runtime.
    pub fn new(role: Role, session_id: Uuid, config: ReconnectConfig, listener: Arc<dyn SessionListener>, timer: Arc<dyn TimerService>) -> anyhow::Result<Arc<OooSession>> {
        config.validate()?;

        debug!("creating {:?} session {}", role, session_id);

        Ok(Arc::new_cyclic(|myself: &Weak<OooSession>| {
            let idle_ack_flush_handle = config.idle_ack_flush_interval
                .map(|interval| tokio::spawn(Self::idle_ack_flush_loop(myself.clone(), interval)));

            OooSession {
                role,
                session_id,
                inner: Mutex::new(SessionInner {
                    session_id,
                    send: SendStateMachine::new(session_id, &config),
                    receive: ReceiveStateMachine::new(config.max_delayed_acks),
                    coordinator: ReconnectCoordinator::new(config.reconnect_enabled),
                    active: None,
                    pending: None,
                    restore_timer: None,
                    next_connection_id: 0,
                    completed_handshakes: 0,
                }),
                config,
                inbound: Mutex::new(()),
                send_capacity_notify: Notify::new(),
                terminated: watch::channel(false).0,
                listener,
                timer,
                myself: myself.clone(),
                idle_ack_flush_handle,
            }
        }))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.coordinator.state()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// The receiver sees `true` once the session is terminated. It sees the sender closed if the
    ///  session is dropped without terminating.
    pub fn subscribe_terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    /// the number of physical connections that completed the handshake so far
    pub async fn completed_handshakes(&self) -> i64 {
        self.inner.lock().await.completed_handshakes
    }

    /// highest sequence number delivered to the listener
    pub async fn received(&self) -> i64 {
        self.inner.lock().await.receive.received()
    }

    pub async fn last_acked(&self) -> i64 {
        self.inner.lock().await.receive.last_acked()
    }

    pub async fn unacked_sequences(&self) -> Vec<i64> {
        self.inner.lock().await.send.unacked_sequences()
    }

    /// Sends a message, waiting for capacity in the send window (or the send queue while there
    ///  is no physical connection). Returns the message's sequence number.
    pub async fn send(&self, payload: Bytes) -> Result<i64, SendError> {
        loop {
            let notified = self.send_capacity_notify.notified();
            tokio::pin!(notified);
            // register before checking, so a wakeup between the check and the wait is not lost
            notified.as_mut().enable();

            match self.try_send(payload.clone()).await {
                Err(SendError::WindowFull) | Err(SendError::QueueFull) => {
                    trace!("waiting for send capacity");
                    notified.await;
                }
                result => return result,
            }
        }
    }

    /// Sends a message if there is capacity, failing with `WindowFull` or `QueueFull` otherwise
    pub async fn try_send(&self, payload: Bytes) -> Result<i64, SendError> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if inner.coordinator.is_terminal() {
            return Err(SendError::SessionTerminated);
        }

        match inner.send.try_send(payload.clone())? {
            Enqueued::Transmit(sequence) => {
                if let Some((_, channel)) = &inner.active {
                    let msg = ProtocolMessage::send(inner.session_id, sequence, inner.receive.ack_sequence(), payload);
                    // the message stays unacked if this fails, and it is replayed after the reconnect
                    SessionInner::transmit(channel, msg).await;
                }
                Ok(sequence)
            }
            Enqueued::Deferred(sequence) => {
                trace!("no physical connection - message #{} will be sent after the reconnect", sequence);
                Ok(sequence)
            }
        }
    }

    /// Terminates the session, sending a GOODBYE to the peer on a best-effort basis. Senders
    ///  blocked on capacity fail with `SessionTerminated`. This does not notify the listener.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if !inner.coordinator.on_goodbye() {
            debug!("session {} is already terminated", inner.session_id);
            return;
        }
        info!("closing session {}", inner.session_id);

        if let Some((_, channel)) = &inner.active {
            SessionInner::transmit(channel, ProtocolMessage::goodbye(inner.session_id)).await;
        }
        self.terminate(inner);
    }

    /// Closes the current physical connection without affecting the logical session directly.
    ///  The transport reports the disconnect back, and `forced` marks it as an intentional
    ///  shutdown that skips the restore window.
    pub async fn disconnect(&self, forced: bool) {
        let inner = self.inner.lock().await;
        if let Some((id, channel)) = &inner.active {
            debug!("disconnecting connection {} (forced: {})", id, forced);
            channel.close(forced);
        }
        if let Some(pending) = &inner.pending {
            pending.channel.close(forced);
        }
    }

    /// Sends an explicit ACK if there are delivered messages that were not acked yet
    pub async fn flush_pending_ack(&self) {
        let mut inner = self.inner.lock().await;
        if inner.coordinator.state() != SessionState::Connected {
            return;
        }
        if let Some(ack_sequence) = inner.receive.pending_ack() {
            inner.send_ack(ack_sequence).await;
        }
    }

    /// A new physical connection is up. The client starts the handshake right away, the server
    ///  waits for the client's HANDSHAKE. Either way, the connection carries no messages until
    ///  the handshake is complete.
    pub async fn on_connected(&self, channel: Arc<dyn FrameChannel>) -> anyhow::Result<ConnectionId> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if inner.coordinator.is_terminal() {
            bail!("session {} is terminated", inner.session_id);
        }

        let connection_id = inner.next_connection_id;
        inner.next_connection_id += 1;

        if let Some(previous) = inner.pending.take() {
            debug!("connection {} replaces connection {} which did not complete the handshake", connection_id, previous.id);
            previous.handshake_timer.cancel();
            previous.channel.close(false);
        }

        if self.role == Role::Client {
            let handshake = ProtocolMessage::handshake(inner.session_id, inner.completed_handshakes, inner.receive.ack_sequence());
            SessionInner::transmit(&channel, handshake).await;
        }

        let myself = self.myself.clone();
        let handshake_timer = self.timer.schedule(self.config.handshake_timeout, Box::pin(async move {
            if let Some(session) = myself.upgrade() {
                session.on_handshake_timeout(connection_id).await;
            }
        }));

        debug!("connection {} established for session {}, waiting for handshake", connection_id, inner.session_id);
        inner.pending = Some(PendingConnection {
            id: connection_id,
            channel,
            handshake_timer,
        });
        Ok(connection_id)
    }

    /// Handles a frame received on a physical connection. An error means the connection is
    ///  corrupt or was rejected, and the transport must close it - the session state is not
    ///  affected by the offending frame.
    pub async fn on_frame_received(&self, connection_id: ConnectionId, frame: Bytes) -> anyhow::Result<()> {
        let _inbound = self.inbound.lock().await;

        let msg = ProtocolMessage::parse(frame)?;
        let mut events = Vec::new();
        let result = self.handle_message(connection_id, msg, &mut events).await;
        self.emit(events).await;
        result
    }

    async fn handle_message(&self, connection_id: ConnectionId, msg: ProtocolMessage, events: &mut Vec<SessionEvent>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if msg.session_id != inner.session_id {
            if msg.flags == MessageFlags::Handshake && inner.is_pending(connection_id) {
                if let Some(pending) = &inner.pending {
                    SessionInner::transmit(&pending.channel, ProtocolMessage::handshake_fail(msg.session_id)).await;
                }
            }
            return Err(ProtocolError::SessionMismatch { expected: inner.session_id, actual: msg.session_id }.into());
        }

        if inner.is_pending(connection_id) {
            return match (self.role, msg.flags) {
                (Role::Server, MessageFlags::Handshake) | (Role::Client, MessageFlags::HandshakeOk) => {
                    self.complete_handshake(inner, msg.ack_sequence, events).await
                }
                (Role::Client, MessageFlags::HandshakeFail) => {
                    bail!("peer rejected the handshake for session {}", inner.session_id)
                }
                (_, flags) => {
                    bail!("expected handshake on connection {}, received {:?}", connection_id, flags)
                }
            };
        }

        if !inner.is_active(connection_id) {
            trace!("dropping {:?} message received on outdated connection {}", msg.flags, connection_id);
            return Ok(());
        }

        match msg.flags {
            MessageFlags::Send => {
                self.on_ack(inner, msg.ack_sequence);
                match inner.receive.on_send_message(msg.sequence) {
                    ReceiveAction::Deliver { ack } => {
                        if let Some(ack_sequence) = ack {
                            inner.send_ack(ack_sequence).await;
                        }
                        events.push(SessionEvent::Message(msg.payload));
                    }
                    ReceiveAction::DuplicateAck(ack_sequence) | ReceiveAction::GapAck(ack_sequence) => {
                        inner.send_ack(ack_sequence).await;
                    }
                }
            }
            MessageFlags::Ack => {
                self.on_ack(inner, msg.ack_sequence);
            }
            MessageFlags::Goodbye => {
                if inner.coordinator.on_goodbye() {
                    info!("peer closed session {}", inner.session_id);
                    self.terminate(inner);
                    events.push(SessionEvent::Lost(SessionLossReason::Goodbye));
                }
            }
            MessageFlags::Handshake | MessageFlags::HandshakeOk | MessageFlags::HandshakeFail => {
                bail!("unexpected {:?} on established connection {}", msg.flags, connection_id);
            }
        }
        Ok(())
    }

    fn on_ack(&self, inner: &mut SessionInner, ack_sequence: i64) {
        if inner.send.on_ack(ack_sequence) > 0 {
            self.send_capacity_notify.notify_waiters();
        }
    }

    /// Promotes the pending connection to the active one: the peer's ack retires what it has,
    ///  and everything else is replayed in its original order.
    async fn complete_handshake(&self, inner: &mut SessionInner, peer_ack: i64, events: &mut Vec<SessionEvent>) -> anyhow::Result<()> {
        let Some(pending) = inner.pending.take() else {
            bail!("no pending connection");
        };
        pending.handshake_timer.cancel();

        let outcome = inner.coordinator.on_handshake_completed();
        if outcome == HandshakeOutcome::Rejected {
            if self.role == Role::Server {
                SessionInner::transmit(&pending.channel, ProtocolMessage::handshake_fail(inner.session_id)).await;
            }
            bail!("session {} is terminated", inner.session_id);
        }

        if let Some(restore_timer) = inner.restore_timer.take() {
            restore_timer.cancel();
        }
        if let Some((previous_id, previous)) = inner.active.take() {
            debug!("connection {} replaces connection {}", pending.id, previous_id);
            previous.close(false);
            inner.send.on_channel_down();
        }

        self.on_ack(inner, peer_ack);
        let ack_sequence = inner.receive.ack_sequence();
        if self.role == Role::Server {
            SessionInner::transmit(&pending.channel, ProtocolMessage::handshake_ok(inner.session_id, ack_sequence)).await;
        }

        for msg in inner.send.on_reconnect(ack_sequence) {
            if !SessionInner::transmit(&pending.channel, msg).await {
                break;
            }
        }

        debug!("handshake complete on connection {}: {:?}", pending.id, outcome);
        inner.active = Some((pending.id, pending.channel));
        inner.completed_handshakes += 1;
        // messages held back by the send queue cap went out with the replay
        self.send_capacity_notify.notify_waiters();

        if outcome == HandshakeOutcome::Restored {
            events.push(SessionEvent::Restored);
        }
        Ok(())
    }

    /// The transport lost or closed a physical connection. Losing the active connection opens
    ///  the restore window, unless reconnecting is disabled or the disconnect was `forced`.
    pub async fn on_disconnected(&self, connection_id: ConnectionId, forced: bool) {
        let _inbound = self.inbound.lock().await;

        let lost = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;

            let outcome = if inner.is_pending(connection_id) {
                if let Some(pending) = inner.pending.take() {
                    pending.handshake_timer.cancel();
                }
                debug!("connection {} dropped before completing the handshake", connection_id);
                if forced {
                    inner.coordinator.on_disconnected(true)
                }
                else {
                    DisconnectOutcome::Ignored
                }
            }
            else if inner.is_active(connection_id) {
                inner.active = None;
                inner.send.on_channel_down();
                debug!("active connection {} of session {} dropped (forced: {})", connection_id, inner.session_id, forced);
                inner.coordinator.on_disconnected(forced)
            }
            else {
                trace!("ignoring disconnect of outdated connection {}", connection_id);
                DisconnectOutcome::Ignored
            };

            match outcome {
                DisconnectOutcome::RestoreWindowOpened { timer_epoch } => {
                    info!("session {} lost its physical connection - waiting {:?} for a reconnect", inner.session_id, self.config.reconnect_timeout);
                    let myself = self.myself.clone();
                    inner.restore_timer = Some(self.timer.schedule(self.config.reconnect_timeout, Box::pin(async move {
                        if let Some(session) = myself.upgrade() {
                            session.on_restore_timeout(timer_epoch).await;
                        }
                    })));
                    None
                }
                DisconnectOutcome::Lost(reason) => {
                    warn!("session {} is lost: {:?}", inner.session_id, reason);
                    self.terminate(inner);
                    Some(reason)
                }
                DisconnectOutcome::Ignored => None,
            }
        };

        if let Some(reason) = lost {
            self.listener.on_session_lost(reason).await;
        }
    }

    async fn on_restore_timeout(&self, timer_epoch: u64) {
        let _inbound = self.inbound.lock().await;

        let is_lost = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            if inner.coordinator.on_restore_timeout(timer_epoch) {
                // this is the timer's own task, so it must not be aborted
                inner.restore_timer = None;
                self.terminate(inner);
                true
            }
            else {
                false
            }
        };

        if is_lost {
            self.listener.on_session_lost(SessionLossReason::RestoreTimeout).await;
        }
    }

    async fn on_handshake_timeout(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        if !inner.is_pending(connection_id) {
            return;
        }
        if let Some(pending) = inner.pending.take() {
            warn!("connection {} did not complete the handshake within {:?} - closing it", connection_id, self.config.handshake_timeout);
            pending.channel.close(false);
        }
    }

    /// Cleanup for all terminal states. The coordinator already made the transition.
    fn terminate(&self, inner: &mut SessionInner) {
        if let Some(restore_timer) = inner.restore_timer.take() {
            restore_timer.cancel();
        }
        if let Some(pending) = inner.pending.take() {
            pending.handshake_timer.cancel();
            pending.channel.close(false);
        }
        if let Some((_, channel)) = inner.active.take() {
            channel.close(false);
        }
        inner.send.on_channel_down();

        self.terminated.send_replace(true);
        self.send_capacity_notify.notify_waiters();
    }

    async fn emit(&self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Message(payload) => self.listener.on_message(payload).await,
                SessionEvent::Restored => self.listener.on_session_restored().await,
                SessionEvent::Lost(reason) => self.listener.on_session_lost(reason).await,
            }
        }
    }

    async fn idle_ack_flush_loop(session: Weak<OooSession>, interval: Duration) {
        let mut interval = time::interval(interval);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_terminated() {
                return;
            }
            session.flush_pending_ack().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::UNSET_SEQUENCE;
    use crate::test_util::{CollectingListener, ListenerEvent, RecordingFrameChannel};
    use crate::timer::TokioTimerService;
    use crate::transport::MockFrameChannel;
    use mockall::predicate::eq;
    use rstest::rstest;

    const SESSION_ID: Uuid = Uuid::from_u128(0x1234);

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            reconnect_timeout: Duration::from_secs(5),
            max_delayed_acks: 16,
            send_window: 32,
            idle_ack_flush_interval: None,
            ..ReconnectConfig::default()
        }
    }

    fn session(role: Role, config: ReconnectConfig) -> (Arc<OooSession>, Arc<CollectingListener>) {
        let listener = Arc::new(CollectingListener::default());
        let session = OooSession::new(role, SESSION_ID, config, listener.clone(), TokioTimerService::new_shared()).unwrap();
        (session, listener)
    }

    /// a server session with a completed handshake on a recording channel
    async fn connected_server(config: ReconnectConfig) -> (Arc<OooSession>, Arc<CollectingListener>, Arc<RecordingFrameChannel>, ConnectionId) {
        let (session, listener) = session(Role::Server, config);
        let (channel, id) = reconnect_server(&session, UNSET_SEQUENCE).await;
        (session, listener, channel, id)
    }

    async fn reconnect_server(session: &OooSession, client_ack: i64) -> (Arc<RecordingFrameChannel>, ConnectionId) {
        let channel = RecordingFrameChannel::new();
        let id = session.on_connected(channel.clone()).await.unwrap();
        session.on_frame_received(id, ProtocolMessage::handshake(SESSION_ID, 0, client_ack).to_frame()).await.unwrap();
        (channel, id)
    }

    fn send_frame(sequence: i64, ack_sequence: i64) -> Bytes {
        ProtocolMessage::send(SESSION_ID, sequence, ack_sequence, payload(sequence)).to_frame()
    }

    fn payload(n: i64) -> Bytes {
        Bytes::from(format!("msg-{}", n))
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let listener = Arc::new(CollectingListener::default());
        let config = ReconnectConfig {
            max_delayed_acks: 16,
            send_window: 8,
            ..ReconnectConfig::default()
        };
        assert!(OooSession::new(Role::Client, SESSION_ID, config, listener, TokioTimerService::new_shared()).is_err());
    }

    #[tokio::test]
    async fn test_client_handshake() {
        let (session, listener) = session(Role::Client, config());
        let channel = RecordingFrameChannel::new();

        let id = session.on_connected(channel.clone()).await.unwrap();
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::handshake(SESSION_ID, 0, UNSET_SEQUENCE)]);
        assert_eq!(session.state().await, SessionState::Initial);

        // messages sent before the handshake completes are held back
        assert_eq!(session.try_send(payload(0)).await, Ok(0));
        assert!(channel.take_messages().await.is_empty());

        assert_eq!(session.completed_handshakes().await, 0);

        session.on_frame_received(id, ProtocolMessage::handshake_ok(SESSION_ID, UNSET_SEQUENCE).to_frame()).await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(session.completed_handshakes().await, 1);
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::send(SESSION_ID, 0, UNSET_SEQUENCE, payload(0))]);
        assert!(listener.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_handshake() {
        let (_session, listener, channel, _) = connected_server(config()).await;
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::handshake_ok(SESSION_ID, UNSET_SEQUENCE)]);
        assert!(listener.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_delayed_acks() {
        let (session, listener, channel, id) = connected_server(config()).await;
        channel.take_messages().await;

        for seq in 0..=20 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }

        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::ack(SESSION_ID, 15)]);
        assert_eq!(listener.messages().await, (0..=20).map(payload).collect::<Vec<_>>());
        assert_eq!(session.received().await, 20);
        assert_eq!(session.last_acked().await, 15);
    }

    #[tokio::test]
    async fn test_duplicate_and_gap_are_reacked_and_not_delivered() {
        let (session, listener, channel, id) = connected_server(config()).await;
        for seq in 0..3 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }
        channel.take_messages().await;

        session.on_frame_received(id, send_frame(1, UNSET_SEQUENCE)).await.unwrap();
        session.on_frame_received(id, send_frame(5, UNSET_SEQUENCE)).await.unwrap();

        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::ack(SESSION_ID, 2), ProtocolMessage::ack(SESSION_ID, 2)]);
        assert_eq!(listener.messages().await.len(), 3);
        assert_eq!(session.received().await, 2);
    }

    #[tokio::test]
    async fn test_piggy_backed_acks() {
        let (session, _listener, channel, id) = connected_server(config()).await;
        for seq in 0..3 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }
        channel.take_messages().await;

        session.try_send(payload(0)).await.unwrap();
        session.try_send(payload(1)).await.unwrap();
        let sent = channel.take_messages().await;
        assert_eq!(sent.iter().map(|m| m.ack_sequence).collect::<Vec<_>>(), vec![2, 2]);
        assert_eq!(session.last_acked().await, 2);

        session.on_frame_received(id, send_frame(3, 0)).await.unwrap();
        assert_eq!(session.unacked_sequences().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_unacked() {
        let (session, listener, channel, id) = connected_server(config()).await;
        for seq in 0..=20 {
            session.try_send(payload(seq)).await.unwrap();
        }
        session.on_frame_received(id, ProtocolMessage::ack(SESSION_ID, 15).to_frame()).await.unwrap();
        assert_eq!(session.unacked_sequences().await, (16..=20).collect::<Vec<_>>());

        session.on_disconnected(id, false).await;
        assert_eq!(session.state().await, SessionState::RestoreWindowOpen);

        // sent while disconnected: sequenced, but not transmitted
        assert_eq!(session.try_send(payload(21)).await, Ok(21));
        channel.take_messages().await;

        time::sleep(Duration::from_secs(2)).await;
        let (channel, _) = reconnect_server(&session, 17).await;

        let sent = channel.take_messages().await;
        assert_eq!(sent[0], ProtocolMessage::handshake_ok(SESSION_ID, UNSET_SEQUENCE));
        assert_eq!(sent[1..].iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![18, 19, 20, 21]);
        assert_eq!(sent[1].payload, payload(18));

        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(listener.events().await, vec![ListenerEvent::Restored]);

        // the restore timer was cancelled
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session.state().await, SessionState::Connected);
        assert_eq!(listener.events().await, vec![ListenerEvent::Restored]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_absorbs_replay() {
        let (session, listener, _channel, id) = connected_server(config()).await;
        for seq in 0..=20 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }
        session.on_disconnected(id, false).await;

        let (channel, id) = reconnect_server(&session, UNSET_SEQUENCE).await;
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::handshake_ok(SESSION_ID, 20)]);

        for seq in 16..=22 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }
        assert_eq!(session.received().await, 22);
        assert_eq!(listener.messages().await, (0..=22).map(payload).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_disconnect_skips_restore_window() {
        let (session, listener, _channel, id) = connected_server(config()).await;
        session.try_send(payload(0)).await.unwrap();

        session.on_disconnected(id, true).await;

        assert_eq!(session.state().await, SessionState::PermanentlyLost);
        assert_eq!(listener.events().await, vec![ListenerEvent::Lost(SessionLossReason::ForcedDisconnect)]);
        assert!(session.inner.lock().await.restore_timer.is_none());
        assert!(session.is_terminated());

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(listener.events().await.len(), 1);
        assert_eq!(session.try_send(payload(1)).await, Err(SendError::SessionTerminated));
    }

    #[rstest]
    #[case::graceful(false)]
    #[case::forced(true)]
    fn test_disconnect_closes_active_channel(#[case] forced: bool) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (session, _listener, channel, _id) = connected_server(config()).await;

            session.disconnect(forced).await;

            assert!(channel.is_closed());
            assert_eq!(channel.is_forced(), forced);
            // nothing changes before the transport reports the disconnect
            assert_eq!(session.state().await, SessionState::Connected);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_disabled() {
        let config = ReconnectConfig {
            reconnect_enabled: false,
            ..config()
        };
        let (session, listener, _channel, id) = connected_server(config).await;
        session.on_disconnected(id, false).await;

        assert_eq!(session.state().await, SessionState::PermanentlyLost);
        assert_eq!(listener.events().await, vec![ListenerEvent::Lost(SessionLossReason::ReconnectDisabled)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_timeout_fires_once() {
        let (session, listener, _channel, id) = connected_server(config()).await;
        session.on_disconnected(id, false).await;
        session.on_disconnected(id, false).await;

        time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(session.state().await, SessionState::RestoreWindowOpen);
        assert!(listener.events().await.is_empty());

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state().await, SessionState::PermanentlyLost);
        assert_eq!(listener.events().await, vec![ListenerEvent::Lost(SessionLossReason::RestoreTimeout)]);

        // a late reconnect attempt is rejected
        let channel = RecordingFrameChannel::new();
        assert!(session.on_connected(channel).await.is_err());

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(listener.events().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_attempt_keeps_window_open() {
        let (session, listener, _channel, id) = connected_server(config()).await;
        session.on_disconnected(id, false).await;

        let channel = RecordingFrameChannel::new();
        let id = session.on_connected(channel.clone()).await.unwrap();
        let result = session.on_frame_received(id, ProtocolMessage::handshake(Uuid::from_u128(99), 1, UNSET_SEQUENCE).to_frame()).await;
        assert!(result.is_err());
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::handshake_fail(Uuid::from_u128(99))]);

        session.on_disconnected(id, false).await;
        assert_eq!(session.state().await, SessionState::RestoreWindowOpen);

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(listener.events().await, vec![ListenerEvent::Lost(SessionLossReason::RestoreTimeout)]);
    }

    #[tokio::test]
    async fn test_client_rejects_session_mismatch() {
        let (session, _listener) = session(Role::Client, config());
        let channel = RecordingFrameChannel::new();
        let id = session.on_connected(channel.clone()).await.unwrap();

        let result = session.on_frame_received(id, ProtocolMessage::handshake_ok(Uuid::from_u128(99), UNSET_SEQUENCE).to_frame()).await;
        match result {
            Err(e) => assert!(matches!(e.downcast_ref::<ProtocolError>(), Some(ProtocolError::SessionMismatch { .. }))),
            Ok(_) => panic!("session mismatch should be rejected"),
        }
        assert_eq!(session.state().await, SessionState::Initial);
    }

    #[tokio::test]
    async fn test_client_handshake_fail() {
        let (session, _listener) = session(Role::Client, config());
        let channel = RecordingFrameChannel::new();
        let id = session.on_connected(channel.clone()).await.unwrap();

        assert!(session.on_frame_received(id, ProtocolMessage::handshake_fail(SESSION_ID).to_frame()).await.is_err());
        session.on_disconnected(id, false).await;
        assert_eq!(session.state().await, SessionState::Initial);
        assert_eq!(session.completed_handshakes().await, 0);
        assert!(!session.is_terminated());
    }

    #[rstest]
    #[case::truncated(Bytes::from_static(b"abc"))]
    #[case::corrupted({
        let mut frame = ProtocolMessage::ack(SESSION_ID, 3).to_frame().to_vec();
        frame[20] ^= 1;
        Bytes::from(frame)
    })]
    fn test_corrupt_frame_does_not_affect_state(#[case] frame: Bytes) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (session, _listener, _channel, id) = connected_server(config()).await;
            session.try_send(payload(0)).await.unwrap();

            assert!(session.on_frame_received(id, frame).await.is_err());
            assert_eq!(session.unacked_sequences().await, vec![0]);
            assert_eq!(session.state().await, SessionState::Connected);
        });
    }

    #[tokio::test]
    async fn test_frames_from_outdated_connection_are_ignored() {
        let (session, listener, _channel, old_id) = connected_server(config()).await;
        let (_channel, _) = reconnect_server(&session, UNSET_SEQUENCE).await;

        session.on_frame_received(old_id, send_frame(0, UNSET_SEQUENCE)).await.unwrap();
        assert!(listener.messages().await.is_empty());

        session.on_disconnected(old_id, false).await;
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_send_waits_for_ack() {
        let config = ReconnectConfig {
            max_delayed_acks: 2,
            send_window: 4,
            ..config()
        };
        let (session, _listener, _channel, id) = connected_server(config).await;
        for n in 0..4 {
            session.send(payload(n)).await.unwrap();
        }
        assert_eq!(session.try_send(payload(4)).await, Err(SendError::WindowFull));

        let blocked = {
            let session = session.clone();
            tokio::spawn(async move { session.send(payload(4)).await })
        };
        time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        session.on_frame_received(id, ProtocolMessage::ack(SESSION_ID, 0).to_frame()).await.unwrap();
        assert_eq!(blocked.await.unwrap(), Ok(4));
        assert_eq!(session.unacked_sequences().await, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_send_fails_on_termination() {
        let config = ReconnectConfig {
            max_delayed_acks: 1,
            send_window: 2,
            ..config()
        };
        let (session, _listener, _channel, _id) = connected_server(config).await;
        session.send(payload(0)).await.unwrap();
        session.send(payload(1)).await.unwrap();

        let blocked = {
            let session = session.clone();
            tokio::spawn(async move { session.send(payload(2)).await })
        };
        time::sleep(Duration::from_millis(100)).await;

        session.close().await;
        assert_eq!(blocked.await.unwrap(), Err(SendError::SessionTerminated));
    }

    #[tokio::test]
    async fn test_close_sends_goodbye() {
        let (session, listener, channel, _id) = connected_server(config()).await;
        channel.take_messages().await;

        session.close().await;

        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::goodbye(SESSION_ID)]);
        assert!(channel.is_closed());
        assert_eq!(session.state().await, SessionState::Closed);
        assert!(listener.events().await.is_empty());
        assert_eq!(session.try_send(payload(0)).await, Err(SendError::SessionTerminated));
    }

    #[tokio::test]
    async fn test_termination_is_observable() {
        let (session, _listener, _channel, _id) = connected_server(config()).await;
        let mut terminated = session.subscribe_terminated();
        assert!(!*terminated.borrow());

        let waiter = tokio::spawn(async move {
            terminated.wait_for(|is_terminated| *is_terminated).await.is_ok()
        });
        session.close().await;

        assert!(time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
        assert!(session.is_terminated());
    }

    #[tokio::test]
    async fn test_receive_goodbye() {
        let (session, listener, _channel, id) = connected_server(config()).await;

        session.on_frame_received(id, ProtocolMessage::goodbye(SESSION_ID).to_frame()).await.unwrap();

        assert_eq!(session.state().await, SessionState::Closed);
        assert_eq!(listener.events().await, vec![ListenerEvent::Lost(SessionLossReason::Goodbye)]);
        session.on_disconnected(id, false).await;
        assert_eq!(listener.events().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ack_flush() {
        let config = ReconnectConfig {
            idle_ack_flush_interval: Some(Duration::from_millis(100)),
            ..config()
        };
        let (session, _listener, channel, id) = connected_server(config).await;
        for seq in 0..3 {
            session.on_frame_received(id, send_frame(seq, UNSET_SEQUENCE)).await.unwrap();
        }
        channel.take_messages().await;

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(channel.take_messages().await, vec![ProtocolMessage::ack(SESSION_ID, 2)]);

        time::sleep(Duration::from_millis(500)).await;
        assert!(channel.take_messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_connection() {
        let (session, _listener) = session(Role::Server, config());
        let channel = RecordingFrameChannel::new();
        session.on_connected(channel.clone()).await.unwrap();

        time::sleep(config().handshake_timeout + Duration::from_millis(1)).await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_send_queue_cap_while_disconnected() {
        let config = ReconnectConfig {
            send_queue_cap: 2,
            ..config()
        };
        let (session, _listener) = session(Role::Client, config);

        assert_eq!(session.try_send(payload(0)).await, Ok(0));
        assert_eq!(session.try_send(payload(1)).await, Ok(1));
        assert_eq!(session.try_send(payload(2)).await, Err(SendError::QueueFull));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_is_notified_exactly_once() {
        let mut listener = MockSessionListener::new();
        listener.expect_on_session_lost()
            .with(eq(SessionLossReason::RestoreTimeout))
            .times(1)
            .returning(|_| ());
        listener.expect_on_message()
            .never();
        listener.expect_on_session_restored()
            .never();

        let session = OooSession::new(Role::Server, SESSION_ID, config(), Arc::new(listener), TokioTimerService::new_shared()).unwrap();
        let (_channel, id) = reconnect_server(&session, UNSET_SEQUENCE).await;

        session.on_disconnected(id, false).await;
        time::sleep(Duration::from_secs(6)).await;
        session.on_disconnected(id, true).await;
        session.close().await;
        time::sleep(Duration::from_secs(6)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_lost_in_transit_are_replayed() {
        let (session, _listener, channel, id) = connected_server(config()).await;
        channel.take_messages().await;

        channel.set_fail_sends(true);
        for n in 0..3 {
            assert_eq!(session.try_send(payload(n)).await, Ok(n));
        }
        assert!(channel.take_messages().await.is_empty());
        session.on_disconnected(id, false).await;

        let (channel, _) = reconnect_server(&session, UNSET_SEQUENCE).await;
        let sent = channel.take_messages().await;
        assert_eq!(sent.iter().map(|m| m.flags).collect::<Vec<_>>(), vec![MessageFlags::HandshakeOk, MessageFlags::Send, MessageFlags::Send, MessageFlags::Send]);
        assert_eq!(sent[1..].iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), (0..3).map(payload).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_transmission_keeps_message_unacked() {
        let (session, _listener) = session(Role::Server, config());

        let mut channel = MockFrameChannel::new();
        channel.expect_send_frame()
            .returning(|frame| {
                let msg = ProtocolMessage::parse(frame).unwrap();
                if msg.flags == MessageFlags::Send {
                    Err(anyhow::anyhow!("broken pipe"))
                }
                else {
                    Ok(ProtocolMessage::HEADER_LEN)
                }
            });
        channel.expect_close()
            .never();

        let id = session.on_connected(Arc::new(channel)).await.unwrap();
        session.on_frame_received(id, ProtocolMessage::handshake(SESSION_ID, 0, UNSET_SEQUENCE).to_frame()).await.unwrap();

        assert_eq!(session.try_send(payload(0)).await, Ok(0));
        assert_eq!(session.unacked_sequences().await, vec![0]);
    }
}
