//! Identification handshake.
//!
//! Both sides exchange an ID Request and an ID Response. The initiator sends
//! its request first, the responder answers the initiator's request with its
//! own request followed by its response. Every step is bounded by Ti.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Error, FmtpIdentifier, FmtpPacket, FmtpType, IdRequest, IdResponse, Identification, Role, Ti,
};

/// Frames to send and the result of a [`Handshake`].
#[derive(Debug, Default)]
pub struct HandshakeContext {
    send_queue: VecDeque<Identification>,
    outcome: Option<Result<FmtpIdentifier, Error>>,
}
impl HandshakeContext {
    /// Next identification frame to write.
    pub fn poll_transmit(&mut self) -> Option<FmtpPacket> {
        self.send_queue
            .pop_front()
            .map(|identification| FmtpPacket::identification(&identification))
    }

    /// The remote identifier once the handshake succeeded, or why it failed.
    pub fn take_outcome(&mut self) -> Option<Result<FmtpIdentifier, Error>> {
        self.outcome.take()
    }
}

#[derive(Debug)]
pub enum HandshakeEvent {
    /// The transport is open.
    Start { now: Instant },
    /// An identification message has been received.
    RIdentification { now: Instant, body: Vec<u8> },
    /// A message of another type has been received.
    RUnexpected { typ: u8 },
    /// The transport has been released by the remote side.
    RDisconnect,
    /// Timer Ti has expired.
    TiTimeout,
}

impl HandshakeEvent {
    #[must_use]
    pub fn from_packet(packet: FmtpPacket, now: Instant) -> Self {
        match packet.typ() {
            Some(FmtpType::Identification) => Self::RIdentification {
                now,
                body: packet.into_data(),
            },
            _ => Self::RUnexpected {
                typ: packet.header.raw_type(),
            },
        }
    }
}

/// Identification state machine of one connection.
#[derive(Debug)]
pub struct Handshake(InitializedStateMachine<HandshakeState>);
impl Deref for Handshake {
    type Target = InitializedStateMachine<HandshakeState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for Handshake {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl Handshake {
    /// Handshake of the side that opened the transport towards `remote`.
    pub fn initiator(
        local: FmtpIdentifier,
        remote: FmtpIdentifier,
        ti: Duration,
        ctx: &mut HandshakeContext,
    ) -> Self {
        Self::new(
            HandshakeState {
                local,
                remote: Some(remote),
                role: Role::Initiator,
                ti,
                allowed: None,
            },
            ctx,
        )
    }

    /// Handshake of the accepting side. Without `allowed` every sender is
    /// accepted as long as the request names `local` as receiver.
    pub fn responder(
        local: FmtpIdentifier,
        allowed: Option<Vec<FmtpIdentifier>>,
        ti: Duration,
        ctx: &mut HandshakeContext,
    ) -> Self {
        Self::new(
            HandshakeState {
                local,
                remote: None,
                role: Role::Responder,
                ti,
                allowed,
            },
            ctx,
        )
    }

    fn new(state: HandshakeState, ctx: &mut HandshakeContext) -> Self {
        Self(state.uninitialized_state_machine().init_with_context(ctx))
    }

    pub fn handle_packet(&mut self, packet: FmtpPacket, now: Instant, ctx: &mut HandshakeContext) {
        trace!("handshake received: {packet}");
        self.handle_with_context(&HandshakeEvent::from_packet(packet, now), ctx);
    }

    /// Expiry of the running Ti timer.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state() {
            State::IdPending { ti: Ti(at) } | State::ResponsePending { ti: Ti(at) } => Some(*at),
            State::Idle {} | State::Established {} | State::Failed {} => None,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), State::Established {} | State::Failed {})
    }
}

/// Data shared by all handshake states.
#[derive(Debug)]
pub struct HandshakeState {
    /// Our identifier.
    pub local: FmtpIdentifier,
    /// The peer, known up front by the initiator and learned by the responder.
    pub remote: Option<FmtpIdentifier>,
    pub role: Role,
    /// Duration of every handshake step.
    pub ti: Duration,
    /// Senders a responder accepts, `None` accepts all.
    pub allowed: Option<Vec<FmtpIdentifier>>,
}

impl HandshakeState {
    fn validate(&self, request: &IdRequest) -> bool {
        if request.receiver() != &self.local {
            return false;
        }
        match (&self.remote, &self.allowed) {
            (Some(remote), _) => request.sender() == remote,
            (None, Some(allowed)) => allowed.contains(request.sender()),
            (None, None) => true,
        }
    }

    fn fail(context: &mut HandshakeContext, error: Error) -> Response<State> {
        warn!("handshake failed: {error}");
        context.outcome = Some(Err(error));
        Response::Transition(State::failed())
    }
}

#[state_machine(
    initial = "State::idle()",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Clone, Debug))
)]
impl HandshakeState {
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!(
            "{:?} {:?}: handshake from `{:?}` to `{:?}`",
            self.role, self.remote, prev, next
        );
    }

    #[state]
    fn idle(&mut self, context: &mut HandshakeContext, event: &HandshakeEvent) -> Response<State> {
        match event {
            HandshakeEvent::Start { now } => {
                if let (Role::Initiator, Some(remote)) = (self.role, &self.remote) {
                    context
                        .send_queue
                        .push_back(Identification::Request(IdRequest::new(
                            self.local.clone(),
                            remote.clone(),
                        )));
                }
                Response::Transition(State::id_pending(Ti(*now + self.ti)))
            }
            HandshakeEvent::RDisconnect => Self::fail(context, Error::ConnectionClosed),
            HandshakeEvent::RIdentification { .. }
            | HandshakeEvent::RUnexpected { .. }
            | HandshakeEvent::TiTimeout => Response::Handled,
        }
    }

    #[state]
    fn id_pending(
        &mut self,
        context: &mut HandshakeContext,
        event: &HandshakeEvent,
        #[expect(unused_variables, reason = "needed to store in state")] ti: &Ti,
    ) -> Response<State> {
        match event {
            HandshakeEvent::RIdentification { now, body } => {
                // the peer rejected our request before sending its own
                match IdResponse::decode(body) {
                    Ok(IdResponse::Reject) => return Self::fail(context, Error::RejectedByRemote),
                    Ok(IdResponse::Accept) => {
                        return Self::fail(context, Error::MalformedIdRequest);
                    }
                    Err(_) => (),
                }
                let request = match IdRequest::decode(body) {
                    Ok(request) => request,
                    Err(e) => {
                        context
                            .send_queue
                            .push_back(Identification::Response(IdResponse::Reject));
                        return Self::fail(context, e);
                    }
                };
                if !self.validate(&request) {
                    warn!("invalid identification {request}, rejecting");
                    context
                        .send_queue
                        .push_back(Identification::Response(IdResponse::Reject));
                    return Self::fail(context, Error::RejectedByLocal);
                }
                debug!("valid identification {request}");
                if self.role == Role::Responder {
                    self.remote = Some(request.sender().clone());
                    context
                        .send_queue
                        .push_back(Identification::Request(IdRequest::new(
                            self.local.clone(),
                            request.sender().clone(),
                        )));
                }
                context
                    .send_queue
                    .push_back(Identification::Response(IdResponse::Accept));
                Response::Transition(State::response_pending(Ti(*now + self.ti)))
            }
            HandshakeEvent::TiTimeout => Self::fail(context, Error::ConnectionDeadlineExceeded),
            HandshakeEvent::RDisconnect => Self::fail(context, Error::ConnectionClosed),
            HandshakeEvent::RUnexpected { typ } => {
                Self::fail(context, Error::UnexpectedMessage { typ: *typ })
            }
            HandshakeEvent::Start { .. } => Response::Handled,
        }
    }

    #[state]
    fn response_pending(
        &mut self,
        context: &mut HandshakeContext,
        event: &HandshakeEvent,
        #[expect(unused_variables, reason = "needed to store in state")] ti: &Ti,
    ) -> Response<State> {
        match event {
            HandshakeEvent::RIdentification { body, .. } => match IdResponse::decode(body) {
                Ok(IdResponse::Accept) => {
                    let Some(remote) = self.remote.clone() else {
                        return Self::fail(context, Error::MalformedIdResponse);
                    };
                    info!("connection with {remote} established");
                    context.outcome = Some(Ok(remote));
                    Response::Transition(State::established())
                }
                Ok(IdResponse::Reject) => Self::fail(context, Error::RejectedByRemote),
                Err(e) => Self::fail(context, e),
            },
            HandshakeEvent::TiTimeout => Self::fail(context, Error::ConnectionDeadlineExceeded),
            HandshakeEvent::RDisconnect => Self::fail(context, Error::ConnectionClosed),
            HandshakeEvent::RUnexpected { typ } => {
                Self::fail(context, Error::UnexpectedMessage { typ: *typ })
            }
            HandshakeEvent::Start { .. } => Response::Handled,
        }
    }

    #[state]
    fn established() -> Response<State> {
        Response::Handled
    }

    #[state]
    fn failed() -> Response<State> {
        Response::Handled
    }
}
