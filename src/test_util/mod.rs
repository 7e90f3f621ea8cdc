//! Utilities for testing code on top of OOO sessions: an in-memory physical connection and a
//!  listener that records what a session delivers. They are used for testing the session
//!  itself, but they are also exported for application testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time;
use crate::protocol::coordinator::SessionLossReason;
use crate::protocol::message::ProtocolMessage;
use crate::session::SessionListener;
use crate::transport::FrameChannel;

/// A [FrameChannel] that records the frames sent through it
#[derive(Default)]
pub struct RecordingFrameChannel {
    frames: Mutex<Vec<Bytes>>,
    fail_sends: AtomicBool,
    is_closed: AtomicBool,
    is_forced: AtomicBool,
}

impl RecordingFrameChannel {
    pub fn new() -> Arc<RecordingFrameChannel> {
        Arc::new(RecordingFrameChannel::default())
    }

    /// subsequent sends fail as if the connection were broken
    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.fail_sends.store(fail_sends, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.is_forced.load(Ordering::SeqCst)
    }

    /// returns the frames sent since the previous call
    pub async fn take_frames(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.frames.lock().await)
    }

    /// Returns the messages sent since the previous call. Panics if a frame can not be parsed.
    pub async fn take_messages(&self) -> Vec<ProtocolMessage> {
        self.take_frames().await
            .into_iter()
            .map(|frame| match ProtocolMessage::parse(frame) {
                Ok(msg) => msg,
                Err(e) => panic!("session sent an invalid frame: {}", e),
            })
            .collect()
    }
}

#[async_trait]
impl FrameChannel for RecordingFrameChannel {
    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("simulated send failure");
        }
        let len = frame.len();
        self.frames.lock().await.push(frame);
        Ok(len)
    }

    fn close(&self, forced: bool) {
        if forced {
            self.is_forced.store(true, Ordering::SeqCst);
        }
        self.is_closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenerEvent {
    Restored,
    Lost(SessionLossReason),
}

/// A [SessionListener] that collects payloads and lifecycle events
#[derive(Default)]
pub struct CollectingListener {
    messages: Mutex<Vec<Bytes>>,
    events: Mutex<Vec<ListenerEvent>>,
    changed: Notify,
}

impl CollectingListener {
    pub async fn messages(&self) -> Vec<Bytes> {
        self.messages.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().await.clone()
    }

    /// Waits until at least `num_messages` were delivered, or the timeout expires, and returns
    ///  the messages delivered so far
    pub async fn wait_for_messages(&self, num_messages: usize, timeout: Duration) -> Vec<Bytes> {
        let _ = time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                if self.messages.lock().await.len() >= num_messages {
                    return;
                }
                changed.await;
            }
        }).await;
        self.messages().await
    }

    /// Waits until some event was recorded, or the timeout expires
    pub async fn wait_for_event(&self, timeout: Duration) -> Option<ListenerEvent> {
        let _ = time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                if !self.events.lock().await.is_empty() {
                    return;
                }
                changed.await;
            }
        }).await;
        self.events.lock().await.first().cloned()
    }
}

#[async_trait]
impl SessionListener for CollectingListener {
    async fn on_message(&self, payload: Bytes) {
        self.messages.lock().await.push(payload);
        self.changed.notify_waiters();
    }

    async fn on_session_restored(&self) {
        self.events.lock().await.push(ListenerEvent::Restored);
        self.changed.notify_waiters();
    }

    async fn on_session_lost(&self, reason: SessionLossReason) {
        self.events.lock().await.push(ListenerEvent::Lost(reason));
        self.changed.notify_waiters();
    }
}
