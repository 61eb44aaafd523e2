use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use fmtp_core::{Config, Error, FmtpIdentifier};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select, spawn,
    sync::watch,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{Client, Connection, Handler};

type TcpCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;
type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Accepts FMTP connections as responder.
///
/// Clones share the client, the callbacks and the close signal.
#[derive(Clone)]
pub struct Server {
    client: Client,
    allowed: Option<Vec<FmtpIdentifier>>,
    on_tcp: Option<TcpCallback>,
    on_connection: Option<ConnectionCallback>,
    closed: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("client", &self.client)
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}

impl Server {
    #[must_use]
    pub fn new(config: Config, handler: impl Handler) -> Self {
        Self::from_client(Client::with_handler(config, handler))
    }

    pub(crate) fn from_client(client: Client) -> Self {
        Self {
            client,
            allowed: None,
            on_tcp: None,
            on_connection: None,
            closed: Arc::new(watch::channel(false).0),
        }
    }

    /// Only accept the listed remotes, without any call every sender
    /// addressing our local identifier is accepted.
    #[must_use]
    pub fn allow_remote(mut self, remote: FmtpIdentifier) -> Self {
        self.allowed.get_or_insert_with(Vec::new).push(remote);
        self
    }

    /// Called for every accepted TCP stream, before the handshake.
    #[must_use]
    pub fn on_tcp(mut self, f: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_tcp = Some(Arc::new(f));
        self
    }

    /// Called for every connection that completed the handshake.
    #[must_use]
    pub fn on_connection(mut self, f: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_connection = Some(Arc::new(f));
        self
    }

    /// The client holding the accepted connections.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Binds `addr` and serves until [`Server::close`].
    ///
    /// # Errors
    ///
    /// Bind errors and non temporary accept errors.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Binding to address: {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accepts from `listener` until [`Server::close`].
    ///
    /// Temporary accept errors are retried with exponential backoff.
    ///
    /// # Errors
    ///
    /// The first non temporary accept error.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let mut closed = self.closed.subscribe();
        let mut backoff = Backoff::default();
        loop {
            debug!("Waiting for FMTP connection");
            let accepted = select! {
                () = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                    info!("server closed");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    backoff.reset();
                    if let Some(on_tcp) = &self.on_tcp {
                        on_tcp(addr);
                    }
                    let server = self.clone();
                    spawn(async move { server.handle(stream, addr).await });
                }
                Err(e) if is_temporary(&e) => {
                    let delay = backoff.next_delay();
                    warn!("accept error: {e}; retrying in {delay:?}");
                    sleep(delay).await;
                }
                Err(e) => {
                    error!("accept error: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    /// Stops every accept loop of this server, established connections
    /// stay open.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn handle(&self, stream: TcpStream, addr: SocketAddr) {
        match self
            .client
            .accept_tcp(stream, addr, self.allowed.clone())
            .await
        {
            Ok(conn) => {
                if let Some(on_connection) = &self.on_connection {
                    on_connection(&conn);
                }
            }
            Err(e) => debug!("{addr}: not accepted: {e}"),
        }
    }
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Delay between failed accepts: 5ms doubling up to 1s.
#[derive(Debug, Default)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const MIN: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            Self::MIN
        } else {
            (self.delay * 2).min(Self::MAX)
        };
        self.delay
    }

    fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}
