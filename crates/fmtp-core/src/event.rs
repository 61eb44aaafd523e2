use std::time::Instant;

use tracing::warn;

use crate::{Error, FmtpMessage, FmtpPacket, Payload, SystemSignal};

/// Events that drive the association state machine.
///
/// These events cover received frames, timer expirations and the MT-ASSOC,
/// MT-STOP and MT-DIS service primitives issued by the local user.
#[derive(Debug)]
pub enum Event {
    /// A STARTUP message has been received from the remote system
    RStartup { now: Instant },
    /// A SHUTDOWN message has been received from the remote system
    RShutdown { now: Instant },
    /// A HEARTBEAT message has been received from the remote system
    RHeartbeat { now: Instant },
    /// A system message with an unassigned code has been received
    RSignal { now: Instant, code: [u8; 2] },
    /// An [`FmtpMessage`] has been received from the remote user
    RData { now: Instant, msg: FmtpMessage },
    /// An identification message arrived after the handshake completed
    RIdentification { now: Instant },

    /// Timer Tr (receive silence) has expired
    TrTimeout { now: Instant },
    /// Timer Ts (send silence) has expired
    TsTimeout { now: Instant },
    /// The remote system did not confirm our STARTUP in time
    StartupTimeout,

    /// Startup requested by user (MT-ASSOC service primitive)
    LStartup { now: Instant },
    /// Shutdown requested by user (MT-STOP service primitive)
    LShutdown,
    /// Release of the connection requested by user (MT-DIS service primitive)
    LDisconnect,
    /// User data has been written to the transport
    Transmitted { now: Instant },
}

impl Event {
    /// Translates a received [`FmtpPacket`] to an [`Event`].
    ///
    /// # Errors
    ///
    /// Fails for unknown message types and malformed system bodies, both
    /// are fatal to the connection.
    pub fn from_incoming_packet(packet: FmtpPacket, now: Instant) -> Result<Self, Error> {
        Ok(match packet.into_payload()? {
            Payload::Data(msg) => Self::RData { now, msg },
            Payload::Identification(body) => {
                warn!(
                    "identification message after handshake: {}",
                    String::from_utf8_lossy(&body)
                );
                Self::RIdentification { now }
            }
            Payload::System(SystemSignal::Startup) => Self::RStartup { now },
            Payload::System(SystemSignal::Shutdown) => Self::RShutdown { now },
            Payload::System(SystemSignal::Heartbeat) => Self::RHeartbeat { now },
            Payload::System(SystemSignal::Unknown(code)) => Self::RSignal { now, code },
        })
    }
}
