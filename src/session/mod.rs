//! Session state machine
//!
//! Tracks whether this instance is idle, waiting for peers or actively
//! exchanging aircraft data. The state machine only sees events and the
//! clock; it never touches message bytes.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Externally observable session status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Off,
    /// Sender waiting for an interest beacon
    SendWaiting,
    /// Sender pushing aircraft data
    Sending,
    /// Receiver broadcasting interest beacons
    RecvWaiting,
    /// Receiver consuming aircraft data
    Receiving,
}

impl SessionStatus {
    pub fn role(self) -> Option<Role> {
        match self {
            Self::Off => None,
            Self::SendWaiting | Self::Sending => Some(Role::Sender),
            Self::RecvWaiting | Self::Receiving => Some(Role::Receiver),
        }
    }

    /// Check if aircraft data is flowing
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sending | Self::Receiving)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::SendWaiting => "SEND_WAITING",
            Self::Sending => "SENDING",
            Self::RecvWaiting => "RECV_WAITING",
            Self::Receiving => "RECEIVING",
        };
        f.write_str(s)
    }
}

/// Which side of the exchange this instance plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

/// A status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Timeouts driving the automatic transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Sender falls back to waiting after this long without a beacon
    pub interest_timeout: Duration,
    /// Receiver falls back to waiting after this long without payload
    pub sender_timeout: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            interest_timeout: Duration::from_secs(45),
            sender_timeout: Duration::from_secs(40),
        }
    }
}

/// Session state machine
#[derive(Debug, Clone)]
pub struct Session {
    status: SessionStatus,
    timeouts: SessionTimeouts,
    last_interest: Option<Instant>,
    last_payload: Option<Instant>,
}

impl Session {
    pub fn new(timeouts: SessionTimeouts) -> Self {
        Self {
            status: SessionStatus::Off,
            timeouts,
            last_interest: None,
            last_payload: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    /// Enter the waiting state of `role`.
    ///
    /// Starting the role that is already running is a no-op; starting the
    /// other role first stops the current one.
    pub fn start(&mut self, role: Role) -> Option<Transition> {
        if self.status.role() == Some(role) {
            return None;
        }
        self.last_interest = None;
        self.last_payload = None;
        let to = match role {
            Role::Sender => SessionStatus::SendWaiting,
            Role::Receiver => SessionStatus::RecvWaiting,
        };
        self.transition(to)
    }

    pub fn start_sending(&mut self) -> Option<Transition> {
        self.start(Role::Sender)
    }

    pub fn start_receiving(&mut self) -> Option<Transition> {
        self.start(Role::Receiver)
    }

    /// Any state to `Off`
    pub fn stop(&mut self) -> Option<Transition> {
        self.last_interest = None;
        self.last_payload = None;
        self.transition(SessionStatus::Off)
    }

    /// An interest beacon arrived
    pub fn on_interest(&mut self, now: Instant) -> Option<Transition> {
        match self.status {
            SessionStatus::SendWaiting | SessionStatus::Sending => {
                self.last_interest = Some(now);
                self.transition(SessionStatus::Sending)
            }
            _ => None,
        }
    }

    /// A payload message (settings or aircraft data) arrived from a sender
    pub fn on_payload(&mut self, now: Instant) -> Option<Transition> {
        match self.status {
            SessionStatus::RecvWaiting | SessionStatus::Receiving => {
                self.last_payload = Some(now);
                self.transition(SessionStatus::Receiving)
            }
            _ => None,
        }
    }

    /// Apply timeouts
    pub fn poll(&mut self, now: Instant) -> Option<Transition> {
        match self.status {
            SessionStatus::Sending if expired(self.last_interest, now, self.timeouts.interest_timeout) => {
                self.transition(SessionStatus::SendWaiting)
            }
            SessionStatus::Receiving if expired(self.last_payload, now, self.timeouts.sender_timeout) => {
                self.transition(SessionStatus::RecvWaiting)
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: SessionStatus) -> Option<Transition> {
        let from = self.status;
        if from == to {
            return None;
        }
        self.status = to;
        info!("Session status {} -> {}", from, to);
        Some(Transition { from, to })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionTimeouts::default())
    }
}

fn expired(last: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) >= timeout,
        None => true,
    }
}
