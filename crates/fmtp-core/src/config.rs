use std::time::Duration;

use crate::FmtpIdentifier;

/// Side of the identification handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Opened the transport and sends the first ID Request.
    Initiator,
    /// Accepted the transport and waits for the peer's ID Request.
    Responder,
}

/// Protocol timers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timers {
    /// Deadline of each handshake step.
    pub ti: Duration,
    /// Maximum send silence, heartbeats are sent when it expires.
    pub ts: Duration,
    /// Maximum receive silence before the association is shut down.
    pub tr: Duration,
    /// Deadline for the peer to confirm a STARTUP.
    pub startup: Duration,
}

impl Timers {
    const DEFAULT: Duration = Duration::from_secs(12);

    /// The startup deadline follows `tr` unless overridden.
    #[must_use]
    pub fn new(ti: Duration, ts: Duration, tr: Duration) -> Self {
        Self {
            ti,
            ts,
            tr,
            startup: tr,
        }
    }

    #[must_use]
    pub fn with_startup(mut self, startup: Duration) -> Self {
        self.startup = startup;
        self
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new(Self::DEFAULT, Self::DEFAULT, Self::DEFAULT)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub local_id: FmtpIdentifier,
    pub timers: Timers,
}

impl Config {
    #[must_use]
    pub fn new(local_id: FmtpIdentifier) -> Self {
        Self {
            local_id,
            timers: Timers::default(),
        }
    }

    #[must_use]
    pub fn with_timers(mut self, timers: Timers) -> Self {
        self.timers = timers;
        self
    }
}
