use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};

use fmtp_core::{Config, Error, FmtpIdentifier, Handshake, HandshakeContext};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    net::{TcpSocket, TcpStream, ToSocketAddrs, lookup_host},
    sync::Mutex,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Connection, Discard, Handler, Server, Status,
    agent::{Agent, Peer},
    connection::{Traffic, run_handshake},
};

/// Written to the stream by the accepting side when a handshake fails.
pub const ERROR_INDICATOR: &[u8] = b"ERROR: ILLEGAL\n";

/// Established connections by remote identifier.
#[derive(Clone, Debug, Default)]
pub(crate) struct Registry(Arc<Mutex<HashMap<FmtpIdentifier, Connection>>>);

impl Registry {
    pub(crate) async fn register(&self, conn: Connection) -> Result<(), Error> {
        let mut connections = self.0.lock().await;
        if let Some(existing) = connections.get(conn.remote_id()) {
            if existing.status() != Status::Closed {
                return Err(Error::DuplicateConnection(conn.remote_id().clone()));
            }
        }
        connections.insert(conn.remote_id().clone(), conn);
        Ok(())
    }

    /// Removes the entry of `remote` if it still belongs to `session`.
    pub(crate) async fn unregister(&self, remote: &FmtpIdentifier, session: Uuid) {
        let mut connections = self.0.lock().await;
        if connections
            .get(remote)
            .is_some_and(|conn| conn.session_id() == session)
        {
            connections.remove(remote);
        }
    }

    pub(crate) async fn lookup(&self, remote: &FmtpIdentifier) -> Option<Connection> {
        self.0
            .lock()
            .await
            .get(remote)
            .filter(|conn| conn.status() != Status::Closed)
            .cloned()
    }

    /// Remotes of the open connections, an agent that died without a
    /// teardown leaves a closed entry behind until it is replaced.
    pub(crate) async fn remotes(&self) -> Vec<FmtpIdentifier> {
        let mut remotes: Vec<_> = self
            .0
            .lock()
            .await
            .iter()
            .filter(|(_, conn)| conn.status() != Status::Closed)
            .map(|(remote, _)| remote.clone())
            .collect();
        remotes.sort();
        remotes
    }
}

/// Socket setup for outbound TCP connections.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Dialer {
    local_addr: Option<SocketAddr>,
    nodelay: bool,
    keepalive: bool,
}

impl Dialer {
    /// Binds outbound sockets to `addr` before connecting.
    #[must_use]
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Sets `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets `SO_KEEPALIVE`.
    #[must_use]
    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Opens a configured TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Socket setup, bind and connect errors.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.keepalive)?;
        socket.set_nodelay(self.nodelay)?;
        if let Some(local) = self.local_addr {
            socket.bind(local)?;
        }
        socket.connect(addr).await
    }
}

/// Opens and accepts FMTP connections for one local identifier.
///
/// At most one connection per remote identifier exists at a time. Received
/// user data of every connection goes to the client's [`Handler`].
#[derive(Clone)]
pub struct Client {
    config: Arc<Config>,
    dialer: Dialer,
    registry: Registry,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("dialer", &self.dialer)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// A client that logs and drops received data.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_handler(config, Discard)
    }

    #[must_use]
    pub fn with_handler(config: Config, handler: impl Handler) -> Self {
        Self {
            config: Arc::new(config),
            dialer: Dialer::default(),
            registry: Registry::default(),
            handler: Arc::new(handler),
        }
    }

    /// Replaces the socket setup used by [`Client::connect`] and
    /// [`Client::dial`].
    #[must_use]
    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A server accepting connections into this client.
    #[must_use]
    pub fn server(&self) -> Server {
        Server::from_client(self.clone())
    }

    /// Connects over TCP and runs the handshake as initiator (MT-CON).
    ///
    /// Every resolved address is tried in turn.
    ///
    /// # Errors
    ///
    /// [`Error::DeadlineExceeded`] if `deadline` passes first, the handshake
    /// errors, or the last connect error.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        remote: FmtpIdentifier,
        deadline: Instant,
    ) -> Result<Connection, Error> {
        timeout_at(deadline, async {
            let mut last_error = None;
            for addr in lookup_host(addr).await? {
                debug!("Connecting socket: {addr}");
                match self.dialer.connect(addr).await {
                    Ok(stream) => {
                        return self
                            .establish(stream, Some(addr), Some(remote), None)
                            .await;
                    }
                    Err(e) => {
                        debug!("Could not connect to {addr}: {e}");
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.map_or(Error::ConnectionClosed, Error::Io))
        })
        .await
        .map_err(|_| Error::DeadlineExceeded)?
    }

    /// Connects and associates, closing the connection again if the
    /// association fails.
    ///
    /// # Errors
    ///
    /// As [`Client::connect`] and [`Connection::associate`].
    pub async fn dial(
        &self,
        addr: impl ToSocketAddrs,
        remote: FmtpIdentifier,
        deadline: Instant,
    ) -> Result<Connection, Error> {
        let conn = self.connect(addr, remote, deadline).await?;
        if let Err(e) = conn.associate(deadline).await {
            warn!("{}: association failed: {e}", conn.remote_id());
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Runs the initiator handshake over an already open stream.
    ///
    /// # Errors
    ///
    /// As [`Client::connect`].
    pub async fn connect_stream<S>(
        &self,
        stream: S,
        remote: FmtpIdentifier,
        deadline: Instant,
    ) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        timeout_at(deadline, self.establish(stream, None, Some(remote), None))
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }

    /// Runs the responder handshake over an accepted stream. `allowed`
    /// restricts the accepted senders.
    ///
    /// # Errors
    ///
    /// Handshake errors, the stream then carries [`ERROR_INDICATOR`] and
    /// is shut down.
    pub async fn accept_stream<S>(
        &self,
        stream: S,
        allowed: Option<Vec<FmtpIdentifier>>,
    ) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.establish(stream, None, None, allowed).await
    }

    pub(crate) async fn accept_tcp(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        allowed: Option<Vec<FmtpIdentifier>>,
    ) -> Result<Connection, Error> {
        self.establish(stream, Some(addr), None, allowed).await
    }

    /// The registered connection with `remote`.
    pub async fn connection(&self, remote: &FmtpIdentifier) -> Option<Connection> {
        self.registry.lookup(remote).await
    }

    /// Identifiers of all registered connections, sorted.
    pub async fn remotes(&self) -> Vec<FmtpIdentifier> {
        self.registry.remotes().await
    }

    /// Initiator if `remote` is known, responder otherwise.
    async fn establish<S>(
        &self,
        mut stream: S,
        addr: Option<SocketAddr>,
        remote: Option<FmtpIdentifier>,
        allowed: Option<Vec<FmtpIdentifier>>,
    ) -> Result<Connection, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let local = self.config.local_id.clone();
        let ti = self.config.timers.ti;
        let mut ctx = HandshakeContext::default();
        let responder = remote.is_none();
        let handshake = match remote {
            Some(remote) => Handshake::initiator(local.clone(), remote, ti, &mut ctx),
            None => Handshake::responder(local.clone(), allowed, ti, &mut ctx),
        };

        let mut traffic = Traffic::default();
        let remote = match run_handshake(&mut stream, handshake, &mut ctx, &mut traffic).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("handshake with {addr:?} failed: {e}");
                if responder {
                    let _ = timeout(ti, stream.write_all(ERROR_INDICATOR)).await;
                }
                let _ = timeout(ti, stream.shutdown()).await;
                return Err(e);
            }
        };

        let peer = Peer {
            local,
            remote,
            addr,
            traffic,
        };
        let (agent, conn) = Agent::new(
            stream,
            peer,
            self.config.timers,
            self.handler.clone(),
            self.registry.clone(),
        );
        if let Err(e) = self.registry.register(conn.clone()).await {
            warn!("{e}, closing new connection");
            // never spawned, dropping the agent drops the stream
            drop(agent);
            return Err(e);
        }
        info!(
            "{}/{}: registered connection from {addr:?}",
            conn.remote_id(),
            conn.session_id()
        );
        agent.spawn();
        Ok(conn)
    }
}
