use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    time::Instant,
};

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Error, Event, FmtpIdentifier, FmtpMessage, FmtpPacket, FmtpType, StartupDeadline,
    SystemSignal, Timers, Tr, Ts,
};

/// Why a pending association did not come up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssociationFailure {
    Timeout,
    Refused,
    Aborted,
}

impl From<AssociationFailure> for Error {
    fn from(failure: AssociationFailure) -> Self {
        match failure {
            AssociationFailure::Timeout => Error::AssociationTimeoutExceeded,
            AssociationFailure::Refused => Error::AssociationRefused,
            AssociationFailure::Aborted => Error::AssociationAborted,
        }
    }
}

/// Why an association ended without the local user asking for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Deassociation {
    /// The remote system sent SHUTDOWN.
    Remote,
    /// Nothing was received for Tr.
    PeerSilent,
}

/// Outputs of the association machine besides frames to send and data
/// received.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Associated,
    AssociationFailed(AssociationFailure),
    Deassociated(Deassociation),
    /// User data arrived outside of an association.
    ProtocolViolation(FmtpType),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssociationContext {
    send_queue: VecDeque<SystemSignal>,
    recv_queue: VecDeque<FmtpMessage>,
    notices: VecDeque<Notice>,
}
impl AssociationContext {
    pub fn poll_transmit(&mut self) -> Option<FmtpPacket> {
        self.send_queue.pop_front().map(FmtpPacket::system)
    }
    pub fn poll_receive(&mut self) -> Option<FmtpMessage> {
        self.recv_queue.pop_front()
    }
    pub fn poll_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }
}

/// The timer an [`Association`] waits for next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timer {
    Ts,
    Tr,
    Startup,
}

impl Timer {
    #[must_use]
    pub fn event(self, now: Instant) -> Event {
        match self {
            Timer::Ts => Event::TsTimeout { now },
            Timer::Tr => Event::TrTimeout { now },
            Timer::Startup => Event::StartupTimeout,
        }
    }
}

/// Association state machine of one identified connection.
#[derive(Debug)]
pub struct Association(InitializedStateMachine<AssociationState>);
impl Deref for Association {
    type Target = InitializedStateMachine<AssociationState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for Association {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl Association {
    /// An unassociated machine for an identified peer.
    pub fn new(remote: FmtpIdentifier, timers: Timers, ctx: &mut AssociationContext) -> Self {
        let sm = AssociationState { remote, timers }
            .uninitialized_state_machine()
            .init_with_context(ctx);
        Self(sm)
    }

    /// # Errors
    ///
    /// Fails for frames that cannot be interpreted, these are fatal to the
    /// connection.
    pub fn handle_remote_packet(
        &mut self,
        packet: FmtpPacket,
        now: Instant,
        ctx: &mut AssociationContext,
    ) -> Result<(), Error> {
        trace!("received remote packet: {packet}");
        let event = Event::from_incoming_packet(packet, now)?;
        self.handle_with_context(&event, ctx);
        Ok(())
    }

    /// The earliest running timer and when it fires.
    #[must_use]
    pub fn next_timer(&self) -> Option<(Timer, Instant)> {
        match self.state() {
            State::Unassociated {} => None,
            State::AssociationPending {
                deadline: StartupDeadline(at),
            } => Some((Timer::Startup, *at)),
            State::Associated { tr: Tr(tr), ts: Ts(ts) } => {
                if ts <= tr {
                    Some((Timer::Ts, *ts))
                } else {
                    Some((Timer::Tr, *tr))
                }
            }
        }
    }

    #[must_use]
    pub fn is_associated(&self) -> bool {
        matches!(self.state(), State::Associated { .. })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), State::AssociationPending { .. })
    }
}

#[derive(Debug)]
pub struct AssociationState {
    pub remote: FmtpIdentifier,
    pub timers: Timers,
}

impl AssociationState {
    fn associated_at(&self, now: Instant) -> State {
        State::associated(Tr(now + self.timers.tr), Ts(now + self.timers.ts))
    }
}

#[state_machine(
    initial = "State::unassociated()",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Clone, Debug))
)]
impl AssociationState {
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!(
            "{}: after transitioning from `{:?}` to `{:?}`",
            self.remote, prev, next
        );
    }

    #[state]
    fn unassociated(
        &mut self,
        context: &mut AssociationContext,
        event: &Event,
    ) -> Response<State> {
        match event {
            Event::RStartup { now } => {
                info!("{}: association requested by remote", self.remote);
                context.send_queue.push_back(SystemSignal::Startup);
                context.notices.push_back(Notice::Associated);
                Response::Transition(self.associated_at(*now))
            }
            Event::LStartup { now } => {
                context.send_queue.push_back(SystemSignal::Startup);
                Response::Transition(State::association_pending(StartupDeadline(
                    *now + self.timers.startup,
                )))
            }
            Event::RData { msg, .. } => {
                warn!("{}: data received while unassociated", self.remote);
                context
                    .notices
                    .push_back(Notice::ProtocolViolation(msg.typ()));
                Response::Handled
            }
            Event::RShutdown { .. }
            | Event::RHeartbeat { .. }
            | Event::RSignal { .. }
            | Event::RIdentification { .. }
            | Event::TrTimeout { .. }
            | Event::TsTimeout { .. }
            | Event::StartupTimeout
            | Event::LShutdown
            | Event::LDisconnect
            | Event::Transmitted { .. } => Response::Handled,
        }
    }

    #[state]
    fn association_pending(
        &mut self,
        context: &mut AssociationContext,
        event: &Event,
        #[expect(unused_variables, reason = "needed to store in state")] deadline: &StartupDeadline,
    ) -> Response<State> {
        match event {
            Event::RStartup { now } => {
                info!("{}: association confirmed", self.remote);
                context.notices.push_back(Notice::Associated);
                Response::Transition(self.associated_at(*now))
            }
            Event::StartupTimeout => {
                warn!("{}: association not confirmed in time", self.remote);
                context
                    .notices
                    .push_back(Notice::AssociationFailed(AssociationFailure::Timeout));
                Response::Transition(State::unassociated())
            }
            Event::RShutdown { .. } => {
                warn!("{}: association refused", self.remote);
                context
                    .notices
                    .push_back(Notice::AssociationFailed(AssociationFailure::Refused));
                Response::Transition(State::unassociated())
            }
            Event::LShutdown | Event::LDisconnect => {
                context.send_queue.push_back(SystemSignal::Shutdown);
                context
                    .notices
                    .push_back(Notice::AssociationFailed(AssociationFailure::Aborted));
                Response::Transition(State::unassociated())
            }
            Event::RData { msg, .. } => {
                warn!("{}: data received before association", self.remote);
                context
                    .notices
                    .push_back(Notice::ProtocolViolation(msg.typ()));
                Response::Handled
            }
            Event::RHeartbeat { .. }
            | Event::RSignal { .. }
            | Event::RIdentification { .. }
            | Event::TrTimeout { .. }
            | Event::TsTimeout { .. }
            | Event::LStartup { .. }
            | Event::Transmitted { .. } => Response::Handled,
        }
    }

    #[state]
    fn associated(
        &mut self,
        context: &mut AssociationContext,
        event: &Event,
        tr: &Tr,
        ts: &Ts,
    ) -> Response<State> {
        match event {
            Event::TsTimeout { now } => {
                trace!("{}: sending heartbeat", self.remote);
                context.send_queue.push_back(SystemSignal::Heartbeat);
                Response::Transition(State::associated(*tr, Ts(*now + self.timers.ts)))
            }
            Event::Transmitted { now } => {
                Response::Transition(State::associated(*tr, Ts(*now + self.timers.ts)))
            }
            Event::TrTimeout { .. } => {
                warn!("{}: Tr expired, shutting down association", self.remote);
                context.send_queue.push_back(SystemSignal::Shutdown);
                context
                    .notices
                    .push_back(Notice::Deassociated(Deassociation::PeerSilent));
                Response::Transition(State::unassociated())
            }
            Event::RData { now, msg } => {
                context.recv_queue.push_back(msg.clone());
                Response::Transition(State::associated(Tr(*now + self.timers.tr), *ts))
            }
            Event::RHeartbeat { now }
            | Event::RStartup { now }
            | Event::RSignal { now, .. }
            | Event::RIdentification { now } => {
                Response::Transition(State::associated(Tr(*now + self.timers.tr), *ts))
            }
            Event::RShutdown { .. } => {
                info!("{}: association shut down by remote", self.remote);
                context
                    .notices
                    .push_back(Notice::Deassociated(Deassociation::Remote));
                Response::Transition(State::unassociated())
            }
            Event::LShutdown | Event::LDisconnect => {
                debug!("{}: shutting down association", self.remote);
                context.send_queue.push_back(SystemSignal::Shutdown);
                Response::Transition(State::unassociated())
            }
            Event::LStartup { .. } | Event::StartupTimeout => Response::Handled,
        }
    }
}
