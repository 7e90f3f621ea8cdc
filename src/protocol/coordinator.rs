use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// created, no physical connection has completed the handshake yet
    Initial,
    Connected,
    /// the physical connection was lost, and a new one may resume the session until the
    ///  reconnect timeout expires
    RestoreWindowOpen,
    PermanentlyLost,
    /// terminated by a GOODBYE, sent or received
    Closed,
}
impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::PermanentlyLost | SessionState::Closed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionLossReason {
    RestoreTimeout,
    ForcedDisconnect,
    ReconnectDisabled,
    Goodbye,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectOutcome {
    /// the caller must schedule a restore timer for this epoch
    RestoreWindowOpened { timer_epoch: u64 },
    Lost(SessionLossReason),
    Ignored,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeOutcome {
    /// first physical connection of the logical session
    Established,
    /// a new physical connection resumed the session inside the restore window
    Restored,
    /// a new physical connection replaced one that was not noticed to be broken yet
    Replaced,
    /// the session is terminated and can not be resumed
    Rejected,
}

/// The reconnection state machine of one logical session.
///
/// This is deliberately free of I/O and timers: the caller serializes all calls (holding the
///  session's lock), schedules the restore timer when told to, and reports its expiry back
///  with the epoch it was scheduled for. Every transition out of the restore window bumps the
///  epoch, so a timer that fires after the window was closed is a no-op. That makes 'restored'
///  and 'lost by timeout' mutually exclusive regardless of how timer and I/O events race.
pub struct ReconnectCoordinator {
    state: SessionState,
    reconnect_enabled: bool,
    timer_epoch: u64,
}

impl ReconnectCoordinator {
    pub fn new(reconnect_enabled: bool) -> ReconnectCoordinator {
        ReconnectCoordinator {
            state: SessionState::Initial,
            reconnect_enabled,
            timer_epoch: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A forced disconnect is an intentional shutdown rather than a network failure, so it
    ///  skips the restore window.
    pub fn on_disconnected(&mut self, forced: bool) -> DisconnectOutcome {
        match self.state {
            SessionState::Connected => {
                if forced {
                    self.terminate(SessionState::PermanentlyLost);
                    DisconnectOutcome::Lost(SessionLossReason::ForcedDisconnect)
                }
                else if !self.reconnect_enabled {
                    self.terminate(SessionState::PermanentlyLost);
                    DisconnectOutcome::Lost(SessionLossReason::ReconnectDisabled)
                }
                else {
                    self.state = SessionState::RestoreWindowOpen;
                    self.timer_epoch += 1;
                    debug!("restore window opened (epoch {})", self.timer_epoch);
                    DisconnectOutcome::RestoreWindowOpened { timer_epoch: self.timer_epoch }
                }
            }
            SessionState::Initial | SessionState::RestoreWindowOpen => {
                if forced {
                    self.terminate(SessionState::PermanentlyLost);
                    DisconnectOutcome::Lost(SessionLossReason::ForcedDisconnect)
                }
                else {
                    // a connection attempt failed - nothing to restore yet, or the restore
                    //  window remains open
                    DisconnectOutcome::Ignored
                }
            }
            SessionState::PermanentlyLost | SessionState::Closed => DisconnectOutcome::Ignored,
        }
    }

    pub fn on_handshake_completed(&mut self) -> HandshakeOutcome {
        match self.state {
            SessionState::Initial => {
                self.state = SessionState::Connected;
                HandshakeOutcome::Established
            }
            SessionState::RestoreWindowOpen => {
                self.state = SessionState::Connected;
                self.timer_epoch += 1;
                info!("session restored");
                HandshakeOutcome::Restored
            }
            SessionState::Connected => {
                debug!("new physical connection replaces the current one");
                HandshakeOutcome::Replaced
            }
            SessionState::PermanentlyLost | SessionState::Closed => {
                warn!("rejecting handshake for terminated session ({:?})", self.state);
                HandshakeOutcome::Rejected
            }
        }
    }

    /// returns `true` iff this expiry terminated the session
    #[must_use]
    pub fn on_restore_timeout(&mut self, timer_epoch: u64) -> bool {
        if self.state != SessionState::RestoreWindowOpen || timer_epoch != self.timer_epoch {
            debug!("ignoring outdated restore timer (epoch {}, current {}, state {:?})", timer_epoch, self.timer_epoch, self.state);
            return false;
        }
        warn!("restore window expired - session is permanently lost");
        self.terminate(SessionState::PermanentlyLost);
        true
    }

    /// returns `true` iff the session was open before
    #[must_use]
    pub fn on_goodbye(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.terminate(SessionState::Closed);
        true
    }

    fn terminate(&mut self, state: SessionState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.timer_epoch += 1;
    }
}
