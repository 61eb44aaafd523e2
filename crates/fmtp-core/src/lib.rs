//! Sans-IO core of the Flight Message Transfer Protocol (FMTP).
//!
//! Framing, identification bodies and the two protocol state machines. The
//! machines never touch a socket or a clock: events carry `now`, outputs are
//! queued in a context for the runtime to drain.

mod association;
mod config;
mod error;
mod event;
mod handshake;
mod header;
mod identification;
mod identifier;
mod message;
mod packet;

pub use association::{
    Association, AssociationContext, AssociationFailure, AssociationState, Deassociation, Notice,
    State as AssociationPhase, Timer,
};
pub use config::{Config, Role, Timers};
pub use error::{Error, Result};
pub use event::Event;
pub use handshake::{
    Handshake, HandshakeContext, HandshakeEvent, HandshakeState, State as HandshakePhase,
};
pub use header::{FmtpType, HEADER_LEN, Header, MAX_BODY_LEN, MAX_LENGTH, RESERVED, VERSION};
pub use identification::{IdRequest, IdResponse, Identification, SystemSignal};
pub use identifier::{FmtpIdentifier, MAX_ID_LEN};
pub use message::FmtpMessage;
pub use packet::{FmtpPacket, Payload};

use std::time::Instant;

/// Expiry of the identification timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ti(pub Instant);
/// Expiry of the receive silence timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tr(pub Instant);
/// Expiry of the send silence timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ts(pub Instant);
/// Expiry of the wait for the peer's STARTUP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StartupDeadline(pub Instant);
