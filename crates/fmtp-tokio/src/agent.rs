//! Per connection event loop.
//!
//! The agent task owns the association state and the write half of the
//! stream. It waits for one of: the hard close signal, an inbound frame from
//! the receive task, an order from a [`Connection`] handle or the next
//! association timer. Byte counters are the only state touched elsewhere.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fmtp_core::{
    Association, AssociationContext, Error, Event, FmtpIdentifier, FmtpPacket, Notice, Timers,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadHalf, WriteHalf, split},
    select, spawn,
    sync::{Notify, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout, timeout_at},
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    Connection, Handler, Message, Status,
    client::Registry,
    connection::{Shared, Traffic},
    transport::{self, read_packet},
};

const ORDER_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 64;
const WRITER_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum Command {
    Associate,
    Deassociate,
    Disconnect,
    Send(Message),
}

#[derive(Debug)]
pub(crate) struct Order {
    pub(crate) command: Command,
    pub(crate) deadline: Instant,
    pub(crate) done: oneshot::Sender<Result<(), Error>>,
}

#[derive(Debug)]
enum Inbound {
    Packet(FmtpPacket),
    Error(Error),
}

/// A send waiting for the association to come up.
#[derive(Debug)]
struct PendingSend {
    msg: Message,
    deadline: Instant,
    done: oneshot::Sender<Result<(), Error>>,
}

/// `Break(Some(_))` closes the connection and reports the error to the
/// handler, `Break(None)` closes it quietly.
type Flow = ControlFlow<Option<Error>>;

/// Identity of a freshly identified peer.
#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) local: FmtpIdentifier,
    pub(crate) remote: FmtpIdentifier,
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) traffic: Traffic,
}

pub(crate) struct Agent<S> {
    conn: Connection,
    shared: Arc<Shared>,
    reader: Option<ReadHalf<S>>,
    writer: WriteHalf<S>,
    association: Association,
    ctx: AssociationContext,
    timers: Timers,
    handler: Arc<dyn Handler>,
    registry: Registry,
    orders: mpsc::Receiver<Order>,
    status: watch::Sender<Status>,
    awaiting: Vec<oneshot::Sender<Result<(), Error>>>,
    pending: VecDeque<PendingSend>,
    /// Answered once the stream is shut down.
    disconnected: Option<oneshot::Sender<Result<(), Error>>>,
}

impl<S> Agent<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Prepares the agent and its handle, nothing runs before [`Agent::spawn`].
    pub(crate) fn new(
        stream: S,
        peer: Peer,
        timers: Timers,
        handler: Arc<dyn Handler>,
        registry: Registry,
    ) -> (Self, Connection) {
        let shared = Arc::new(Shared {
            session: Uuid::new_v4(),
            local: peer.local,
            remote: peer.remote.clone(),
            peer_addr: peer.addr,
            tx_bytes: AtomicU64::new(peer.traffic.tx),
            rx_bytes: AtomicU64::new(peer.traffic.rx),
            close: Notify::new(),
        });
        let (orders_tx, orders) = mpsc::channel(ORDER_QUEUE);
        let (status, status_rx) = watch::channel(Status::Established);
        let conn = Connection::new(shared.clone(), orders_tx, status_rx);

        let mut ctx = AssociationContext::default();
        let association = Association::new(peer.remote, timers, &mut ctx);
        let (reader, writer) = split(stream);

        let agent = Self {
            conn: conn.clone(),
            shared,
            reader: Some(reader),
            writer,
            association,
            ctx,
            timers,
            handler,
            registry,
            orders,
            status,
            awaiting: Vec::new(),
            pending: VecDeque::new(),
            disconnected: None,
        };
        (agent, conn)
    }

    /// Starts the receive task and the event loop.
    pub(crate) fn spawn(mut self) -> JoinHandle<()> {
        spawn(async move {
            let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
            let receiver = self
                .reader
                .take()
                .map(|reader| spawn(receive_loop(reader, inbound_tx, self.shared.clone())));
            self.run(inbound).await;
            if let Some(receiver) = receiver {
                receiver.abort();
            }
            self.teardown().await;
        })
    }

    fn tag(&self) -> String {
        format!("{}/{}", self.shared.remote, self.shared.session)
    }

    async fn run(&mut self, mut inbound: mpsc::Receiver<Inbound>) {
        info!("{}: connection established", self.tag());
        loop {
            self.publish();
            let timer = self.association.next_timer();
            let wake = timer.map_or_else(Instant::now, |(_, at)| Instant::from_std(at));

            // unbiased, a busy peer must not starve orders and timers
            let flow = select! {
                () = self.shared.close.notified() => {
                    debug!("{}: closed locally", self.tag());
                    ControlFlow::Break(None)
                }
                packet = inbound.recv() => match packet {
                    Some(Inbound::Packet(packet)) => self.on_packet(packet),
                    Some(Inbound::Error(e)) => ControlFlow::Break(Some(e)),
                    None => {
                        debug!("{}: stream closed by remote", self.tag());
                        ControlFlow::Break(None)
                    }
                },
                order = self.orders.recv() => match order {
                    Some(order) => self.on_order(order).await,
                    None => ControlFlow::Break(None),
                },
                () = sleep_until(wake), if timer.is_some() => {
                    if let Some((timer, _)) = timer {
                        trace!("{}: {timer:?} expired", self.tag());
                        self.association
                            .handle_with_context(&timer.event(Instant::now().into_std()), &mut self.ctx);
                    }
                    ControlFlow::Continue(())
                }
            };

            let flow = match flow {
                ControlFlow::Continue(()) => self.settle().await,
                flow @ ControlFlow::Break(_) => flow,
            };
            if let ControlFlow::Break(error) = flow {
                if let Some(e) = error {
                    error!("{}: {e}", self.tag());
                    self.handler.error(&self.conn, &e);
                }
                return;
            }
        }
    }

    fn publish(&self) {
        let status = if self.association.is_associated() {
            Status::Associated
        } else if self.association.is_pending() {
            Status::AssociationPending
        } else {
            Status::Established
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn on_packet(&mut self, packet: FmtpPacket) -> Flow {
        match self.association.handle_remote_packet(
            packet,
            Instant::now().into_std(),
            &mut self.ctx,
        ) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(Some(e)),
        }
    }

    async fn on_order(&mut self, order: Order) -> Flow {
        let Order {
            command,
            deadline,
            done,
        } = order;
        let now = Instant::now().into_std();
        match command {
            Command::Disconnect => {
                debug!("{}: disconnecting", self.tag());
                self.association
                    .handle_with_context(&Event::LDisconnect, &mut self.ctx);
                if let Err(e) = self.flush(deadline).await {
                    warn!("{}: SHUTDOWN not sent: {e}", self.tag());
                }
                self.resolve_notices();
                self.disconnected = Some(done);
                ControlFlow::Break(None)
            }
            Command::Associate => {
                if self.association.is_associated() {
                    let _ = done.send(Ok(()));
                } else {
                    self.association
                        .handle_with_context(&Event::LStartup { now }, &mut self.ctx);
                    self.awaiting.push(done);
                }
                ControlFlow::Continue(())
            }
            Command::Deassociate => {
                self.association
                    .handle_with_context(&Event::LShutdown, &mut self.ctx);
                let result = self.flush(deadline).await;
                let fatal = result.as_ref().is_err_and(Error::is_fatal);
                let _ = done.send(result);
                if fatal {
                    ControlFlow::Break(None)
                } else {
                    ControlFlow::Continue(())
                }
            }
            Command::Send(msg) => {
                if self.association.is_associated() {
                    self.transmit(msg, deadline, done).await
                } else {
                    self.association
                        .handle_with_context(&Event::LStartup { now }, &mut self.ctx);
                    self.pending.push_back(PendingSend {
                        msg,
                        deadline,
                        done,
                    });
                    ControlFlow::Continue(())
                }
            }
        }
    }

    async fn transmit(
        &mut self,
        msg: Message,
        deadline: Instant,
        done: oneshot::Sender<Result<(), Error>>,
    ) -> Flow {
        if deadline <= Instant::now() {
            let _ = done.send(Err(Error::DeadlineExceeded));
            return ControlFlow::Continue(());
        }
        // body source failures leave the stream untouched
        let packet = match timeout_at(deadline, msg.into_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                debug!("{}: message not sent: {e}", self.tag());
                let _ = done.send(Err(e));
                return ControlFlow::Continue(());
            }
            Err(_) => {
                let _ = done.send(Err(Error::DeadlineExceeded));
                return ControlFlow::Continue(());
            }
        };
        match transport::send_packet(&mut self.writer, packet, deadline).await {
            Ok(n) => {
                self.shared.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                self.association.handle_with_context(
                    &Event::Transmitted {
                        now: Instant::now().into_std(),
                    },
                    &mut self.ctx,
                );
                let _ = done.send(Ok(()));
                ControlFlow::Continue(())
            }
            Err(e) if e.is_fatal() => {
                warn!("{}: send failed: {e}", self.tag());
                let _ = done.send(Err(e));
                ControlFlow::Break(None)
            }
            Err(e) => {
                let _ = done.send(Err(e));
                ControlFlow::Continue(())
            }
        }
    }

    /// Writes queued system messages.
    async fn flush(&mut self, deadline: Instant) -> Result<(), Error> {
        while let Some(packet) = self.ctx.poll_transmit() {
            let n = transport::send_packet(&mut self.writer, packet, deadline).await?;
            self.shared.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Acts on everything the association queued during the last step.
    async fn settle(&mut self) -> Flow {
        if let Err(e) = self.flush(Instant::now() + self.timers.ts).await {
            return ControlFlow::Break(Some(e));
        }
        while let Some(msg) = self.ctx.poll_receive() {
            trace!("{}: msg received, {msg}", self.tag());
            self.handler.handle(&self.conn, msg);
        }
        while let Some(notice) = self.ctx.poll_notice() {
            match notice {
                Notice::Associated => {
                    for done in self.awaiting.drain(..) {
                        let _ = done.send(Ok(()));
                    }
                    while let Some(send) = self.pending.pop_front() {
                        self.transmit(send.msg, send.deadline, send.done).await?;
                    }
                }
                Notice::AssociationFailed(failure) => self.fail_waiting(|| failure.into()),
                Notice::Deassociated(reason) => {
                    info!("{}: association ended: {reason:?}", self.tag());
                    self.handler.shutdown(&self.conn, reason);
                }
                Notice::ProtocolViolation(typ) => {
                    return ControlFlow::Break(Some(Error::DataWhileUnassociated(typ)));
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Resolves association notices on the way out.
    fn resolve_notices(&mut self) {
        while let Some(notice) = self.ctx.poll_notice() {
            if let Notice::AssociationFailed(failure) = notice {
                self.fail_waiting(|| failure.into());
            }
        }
    }

    fn fail_waiting(&mut self, error: impl Fn() -> Error) {
        for done in self.awaiting.drain(..) {
            let _ = done.send(Err(error()));
        }
        for send in self.pending.drain(..) {
            let _ = send.done.send(Err(error()));
        }
    }

    async fn teardown(mut self) {
        let tag = self.tag();
        self.orders.close();
        if timeout(WRITER_SHUTDOWN, self.writer.shutdown()).await.is_err() {
            debug!("{tag}: stream shutdown timed out");
        }
        self.registry
            .unregister(&self.shared.remote, self.shared.session)
            .await;
        self.status.send_replace(Status::Closed);
        info!("{tag}: connection closed");

        self.fail_waiting(|| Error::ConnectionClosed);
        while let Ok(order) = self.orders.try_recv() {
            let result = match order.command {
                Command::Disconnect => Ok(()),
                Command::Associate | Command::Deassociate | Command::Send(_) => {
                    Err(Error::ConnectionClosed)
                }
            };
            let _ = order.done.send(result);
        }
        if let Some(done) = self.disconnected.take() {
            let _ = done.send(Ok(()));
        }
    }
}

async fn receive_loop<R>(mut reader: R, inbound: mpsc::Sender<Inbound>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let event = match read_packet(&mut reader).await {
            Ok(Some(packet)) => {
                shared
                    .rx_bytes
                    .fetch_add(packet.frame_len() as u64, Ordering::Relaxed);
                Inbound::Packet(packet)
            }
            Ok(None) => return,
            Err(e) => Inbound::Error(e),
        };
        let stop = matches!(event, Inbound::Error(_));
        if inbound.send(event).await.is_err() || stop {
            return;
        }
    }
}
