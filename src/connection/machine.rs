//! Connection lifecycle state machine
//!
//! [`ConnectionCore`] holds the connection state, the reconnect attempt
//! counter, the identity of the live session and the pending reconnect timer.
//! It performs no I/O. Every API call, transport completion and timer expiry
//! is fed in as an [`Input`], and the caller executes the returned
//! [`Effect`]s in order. All mutation therefore happens on whichever single
//! task owns the core.
//!
//! Stale inputs are dropped before they can change anything: failure signals
//! while already `Disconnected` are no-ops, and session or timer completions
//! whose tag no longer matches the live session / pending timer are ignored.

use std::time::Duration;

use backoff::backoff::Backoff;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::OutboundMessage;

use super::backoff::ReconnectBackoff;
use super::state::ConnectionState;

/// Tag identifying one transport session
pub type SessionId = u64;

/// Tag identifying one scheduled reconnect
pub type TimerId = u64;

// ─────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────

/// Transport failure reported by a session
///
/// All variants are handled identically: log, go `Disconnected`, release the
/// session and schedule a backoff reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("open failed: {0}")]
    Open(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("undecodable frame: {0}")]
    Decode(String),
}

// ─────────────────────────────────────────────────────────────────
// Inputs & Effects
// ─────────────────────────────────────────────────────────────────

/// Frame handed to a session's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized command
    Text(String),
    /// Heartbeat ping
    Ping,
}

/// Everything that can drive the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Connect,
    Disconnect,
    ReconnectIfNeeded,
    CancelReconnect,
    Send(OutboundMessage),
    Ping,
    /// Transport reached the open state
    Opened(SessionId),
    /// Inbound text (already decoded from binary if needed)
    Received(SessionId, String),
    /// Any read/write/open/close failure on a session
    Failed(SessionId, Failure),
    /// Reconnect timer expired
    ReconnectDue(TimerId),
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Release the given session handle (idempotent)
    Release(SessionId),
    /// Open a new session against the configured endpoint
    Open(SessionId),
    /// Write a frame on the given session
    Transmit(SessionId, OutboundFrame),
    /// Arm the reconnect timer, replacing any previous one
    ScheduleReconnect { timer: TimerId, delay: Duration },
    /// Disarm the reconnect timer
    CancelReconnect(TimerId),
    /// Publish a state transition
    StateChanged(ConnectionState),
    /// Deliver an inbound selection token to the caller
    Deliver(String),
}

// ─────────────────────────────────────────────────────────────────
// State Machine
// ─────────────────────────────────────────────────────────────────

/// I/O-free connection state machine
#[derive(Debug)]
pub struct ConnectionCore {
    state: ConnectionState,
    backoff: ReconnectBackoff,
    session: Option<SessionId>,
    next_session: SessionId,
    reconnect: Option<TimerId>,
    next_timer: TimerId,
}

impl ConnectionCore {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            session: None,
            next_session: 0,
            reconnect: None,
            next_timer: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnects scheduled since the last successful open
    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.backoff.attempt()
    }

    /// The live session, if any
    #[cfg(test)]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// The pending reconnect timer, if any
    #[cfg(test)]
    pub fn pending_reconnect(&self) -> Option<TimerId> {
        self.reconnect
    }

    /// Apply one input and return the effects to execute, in order
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();

        match input {
            Input::Connect => self.connect(&mut effects),

            Input::Disconnect => {
                self.cancel_reconnect(&mut effects);
                self.release_session(&mut effects);
                self.transition(ConnectionState::Disconnected, &mut effects);
            }

            Input::ReconnectIfNeeded => {
                if self.state == ConnectionState::Disconnected {
                    self.connect(&mut effects);
                } else {
                    debug!(state = %self.state, "Reconnect not needed");
                }
            }

            Input::CancelReconnect => self.cancel_reconnect(&mut effects),

            Input::Send(message) => {
                if let Some(session) = self.connected_session() {
                    match message.to_json() {
                        Ok(text) => effects.push(Effect::Transmit(session, OutboundFrame::Text(text))),
                        Err(e) => warn!(error = %e, "Failed to encode outbound message"),
                    }
                } else {
                    debug!(command = %message.command, state = %self.state, "Dropping command while not connected");
                }
            }

            Input::Ping => {
                if let Some(session) = self.connected_session() {
                    effects.push(Effect::Transmit(session, OutboundFrame::Ping));
                }
            }

            Input::Opened(session) => {
                if self.session == Some(session) && self.state == ConnectionState::Connecting {
                    self.backoff.reset();
                    info!(session, "Connection established");
                    self.transition(ConnectionState::Connected, &mut effects);
                } else {
                    debug!(session, state = %self.state, "Ignoring stale open signal");
                }
            }

            Input::Received(session, text) => {
                if self.session == Some(session) && self.state == ConnectionState::Connected {
                    effects.push(Effect::Deliver(text));
                } else {
                    debug!(session, "Ignoring frame from stale session");
                }
            }

            Input::Failed(session, failure) => self.fail(session, failure, &mut effects),

            Input::ReconnectDue(timer) => {
                if self.reconnect != Some(timer) {
                    debug!(timer, "Ignoring cancelled reconnect timer");
                } else {
                    self.reconnect = None;
                    if self.state == ConnectionState::Disconnected {
                        self.connect(&mut effects);
                    } else {
                        debug!(state = %self.state, "Reconnect timer fired while not disconnected");
                    }
                }
            }
        }

        effects
    }

    fn connected_session(&self) -> Option<SessionId> {
        match self.state {
            ConnectionState::Connected => self.session,
            _ => None,
        }
    }

    fn connect(&mut self, effects: &mut Vec<Effect>) {
        self.release_session(effects);

        // A live connection is torn down through Disconnected first
        if self.state == ConnectionState::Connected {
            self.transition(ConnectionState::Disconnected, effects);
        }

        self.next_session += 1;
        let session = self.next_session;
        self.session = Some(session);
        effects.push(Effect::Open(session));
        self.transition(ConnectionState::Connecting, effects);
    }

    fn fail(&mut self, session: SessionId, failure: Failure, effects: &mut Vec<Effect>) {
        if self.session != Some(session) {
            debug!(session, failure = %failure, "Ignoring failure from stale session");
            return;
        }
        if self.state == ConnectionState::Disconnected {
            return;
        }

        warn!(session, failure = %failure, state = %self.state, "Connection failure");
        self.release_session(effects);
        self.transition(ConnectionState::Disconnected, effects);
        self.schedule_reconnect(effects);
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        self.cancel_reconnect(effects);

        let attempt = self.backoff.attempt();
        let Some(delay) = self.backoff.next_backoff() else {
            return;
        };

        self.next_timer += 1;
        let timer = self.next_timer;
        self.reconnect = Some(timer);

        info!(delay_secs = delay.as_secs(), attempt, "Scheduling reconnect");
        effects.push(Effect::ScheduleReconnect { timer, delay });
    }

    fn cancel_reconnect(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.reconnect.take() {
            effects.push(Effect::CancelReconnect(timer));
        }
    }

    fn release_session(&mut self, effects: &mut Vec<Effect>) {
        if let Some(session) = self.session.take() {
            effects.push(Effect::Release(session));
        }
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        debug_assert!(self.state.can_transition_to(next), "{} -> {}", self.state, next);
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        effects.push(Effect::StateChanged(next));
    }
}

impl Default for ConnectionCore {
    fn default() -> Self {
        Self::new(ReconnectBackoff::default())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
