use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use fmtp_core::{Error, FmtpIdentifier, Handshake, HandshakeContext, HandshakeEvent};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc, oneshot, watch},
    time::{Instant, timeout_at},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    Message,
    agent::{Command, Order},
    transport::{read_packet, send_packet},
};

/// Lifecycle of an established connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Identified, no association.
    Established,
    /// STARTUP sent, waiting for the peer's.
    AssociationPending,
    Associated,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) session: Uuid,
    pub(crate) local: FmtpIdentifier,
    pub(crate) remote: FmtpIdentifier,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) close: Notify,
}

/// Handle to an identified FMTP connection.
///
/// Cheap to clone. Every operation is an order to the connection's agent
/// task and resolves once the agent processed it or `deadline` passed,
/// whichever comes first. A deadline does not withdraw an order that the
/// agent already picked up.
#[derive(Clone, Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    orders: mpsc::Sender<Order>,
    status: watch::Receiver<Status>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        orders: mpsc::Sender<Order>,
        status: watch::Receiver<Status>,
    ) -> Self {
        Self {
            shared,
            orders,
            status,
        }
    }

    /// Sends user data (MT-DATA), associating first if needed.
    ///
    /// # Errors
    ///
    /// Association errors if the implicit association fails, transport and
    /// deadline errors of the send itself.
    pub async fn send(&self, msg: impl Into<Message>, deadline: Instant) -> Result<(), Error> {
        self.order(Command::Send(msg.into()), deadline).await
    }

    /// Starts an association (MT-ASSOC), a no-op if already associated.
    ///
    /// # Errors
    ///
    /// [`Error::AssociationTimeoutExceeded`], [`Error::AssociationRefused`] or
    /// [`Error::AssociationAborted`] if the peer does not confirm.
    pub async fn associate(&self, deadline: Instant) -> Result<(), Error> {
        self.order(Command::Associate, deadline).await
    }

    /// Stops the association (MT-STOP), the connection stays open.
    ///
    /// # Errors
    ///
    /// Transport and deadline errors while sending SHUTDOWN.
    pub async fn deassociate(&self, deadline: Instant) -> Result<(), Error> {
        self.order(Command::Deassociate, deadline).await
    }

    /// Releases the connection (MT-DIS), sending SHUTDOWN first when
    /// associated.
    ///
    /// # Errors
    ///
    /// Only [`Error::DeadlineExceeded`], a closed connection counts as
    /// disconnected.
    pub async fn disconnect(&self, deadline: Instant) -> Result<(), Error> {
        match self.order(Command::Disconnect, deadline).await {
            Err(Error::ConnectionClosed) => Ok(()),
            result => result,
        }
    }

    /// Tears the connection down without any further protocol message.
    pub fn close(&self) {
        self.shared.close.notify_one();
    }

    async fn order(&self, command: Command, deadline: Instant) -> Result<(), Error> {
        let (done, result) = oneshot::channel();
        let order = Order {
            command,
            deadline,
            done,
        };
        timeout_at(deadline, async {
            self.orders
                .send(order)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            result.await.map_err(|_| Error::ConnectionClosed)?
        })
        .await
        .map_err(|_| Error::DeadlineExceeded)?
    }

    #[must_use]
    pub fn local_id(&self) -> &FmtpIdentifier {
        &self.shared.local
    }

    #[must_use]
    pub fn remote_id(&self) -> &FmtpIdentifier {
        &self.shared.remote
    }

    /// Random id of this connection, distinguishes reconnects of the same
    /// remote in logs.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.shared.session
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Current status, [`Status::Closed`] as well once the agent is gone
    /// without a teardown.
    #[must_use]
    pub fn status(&self) -> Status {
        if self.orders.is_closed() {
            return Status::Closed;
        }
        *self.status.borrow()
    }

    /// Follows status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        // a dropped sender means the agent is gone as well
        let _ = status.wait_for(|status| *status == Status::Closed).await;
    }

    /// Bytes written to the stream, handshake included.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.shared.tx_bytes.load(Ordering::Relaxed)
    }

    /// Bytes read from the stream, handshake included.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.shared.rx_bytes.load(Ordering::Relaxed)
    }
}

/// Bytes moved during the handshake.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Traffic {
    pub(crate) tx: u64,
    pub(crate) rx: u64,
}

/// Drives `handshake` over `stream` until it succeeds or fails.
pub(crate) async fn run_handshake<S>(
    stream: &mut S,
    mut handshake: Handshake,
    ctx: &mut HandshakeContext,
    traffic: &mut Traffic,
) -> Result<FmtpIdentifier, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ti = handshake.ti;
    handshake.handle_with_context(
        &HandshakeEvent::Start {
            now: Instant::now().into_std(),
        },
        ctx,
    );

    loop {
        while let Some(packet) = ctx.poll_transmit() {
            let deadline = handshake
                .deadline()
                .map_or_else(|| Instant::now() + ti, Instant::from_std);
            match send_packet(stream, packet, deadline).await {
                Ok(n) => traffic.tx += n as u64,
                Err(Error::DeadlineExceeded) => return Err(Error::ConnectionDeadlineExceeded),
                Err(e) => return Err(e),
            }
        }
        if let Some(outcome) = ctx.take_outcome() {
            return outcome;
        }

        let Some(deadline) = handshake.deadline() else {
            return Err(Error::ConnectionClosed);
        };
        match timeout_at(Instant::from_std(deadline), read_packet(stream)).await {
            Err(_) => {
                debug!("ti timed out");
                handshake.handle_with_context(&HandshakeEvent::TiTimeout, ctx);
            }
            Ok(Ok(Some(packet))) => {
                traffic.rx += packet.frame_len() as u64;
                handshake.handle_packet(packet, Instant::now().into_std(), ctx);
            }
            Ok(Ok(None)) => handshake.handle_with_context(&HandshakeEvent::RDisconnect, ctx),
            Ok(Err(e)) => return Err(e),
        }
    }
}
