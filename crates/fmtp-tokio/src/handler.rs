use fmtp_core::{Deassociation, Error, FmtpIdentifier, FmtpMessage};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::Connection;

/// Receives the user data and notifications of associated connections.
///
/// Callbacks run on the connection's agent task and delay everything else
/// on that connection until they return. Offload anything slow.
pub trait Handler: Send + Sync + 'static {
    /// Operational or Operator message received while associated.
    fn handle(&self, conn: &Connection, msg: FmtpMessage);

    /// The association ended without the local user asking for it.
    fn shutdown(&self, conn: &Connection, reason: Deassociation) {
        debug!("{}: association ended: {reason:?}", conn.remote_id());
    }

    /// A fatal error, the connection closes right after.
    fn error(&self, conn: &Connection, error: &Error) {
        warn!("{}: {error}", conn.remote_id());
    }
}

/// Logs and drops everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct Discard;

impl Handler for Discard {
    fn handle(&self, conn: &Connection, msg: FmtpMessage) {
        info!("{}: msg received, {msg}", conn.remote_id());
    }
}

/// Adapter returned by [`handler_fn`].
#[derive(Clone, Debug)]
pub struct HandlerFn<F>(F);

/// Wraps a closure as a [`Handler`] receiving only data.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&Connection, FmtpMessage) + Send + Sync + 'static,
{
    HandlerFn(f)
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Connection, FmtpMessage) + Send + Sync + 'static,
{
    fn handle(&self, conn: &Connection, msg: FmtpMessage) {
        (self.0)(conn, msg);
    }
}

/// What an [`UnboundedSender`] handler forwards.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// See [`Handler::handle`].
    Data {
        /// Sender of the message
        remote: FmtpIdentifier,
        /// The received message
        msg: FmtpMessage,
    },
    /// See [`Handler::shutdown`].
    Shutdown {
        /// Peer of the ended association
        remote: FmtpIdentifier,
        /// Why it ended
        reason: Deassociation,
    },
    /// See [`Handler::error`].
    Failed {
        /// Peer of the closed connection
        remote: FmtpIdentifier,
        /// The error, rendered
        error: String,
    },
}

impl Handler for UnboundedSender<ConnectionEvent> {
    fn handle(&self, conn: &Connection, msg: FmtpMessage) {
        let remote = conn.remote_id().clone();
        if self.send(ConnectionEvent::Data { remote, msg }).is_err() {
            warn!("{}: event receiver dropped, message lost", conn.remote_id());
        }
    }

    fn shutdown(&self, conn: &Connection, reason: Deassociation) {
        let remote = conn.remote_id().clone();
        let _ = self.send(ConnectionEvent::Shutdown { remote, reason });
    }

    fn error(&self, conn: &Connection, error: &Error) {
        let remote = conn.remote_id().clone();
        let _ = self.send(ConnectionEvent::Failed {
            remote,
            error: error.to_string(),
        });
    }
}
